//! Command-line front end for parsing, explaining and running queries
//! against a JSON data file.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use quarry::config::{default_config_path, QuarryConfig, CONFIG_ENV};
use quarry::query::{parse, Compiler, ErrorWithCode, Executor, PageRequest, QueryPlan};
use quarry::reconcile::{project, Reconciler};
use quarry::storage::{MemorySearchIndex, MemoryStore, RecordBody, SearchIndex, SearchScope};
use quarry::types::{EntityId, Version};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Parse, explain and run index queries",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = CONFIG_ENV,
        help = "Config file to load"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(short, long, global = true, action = ArgAction::Count, help = "Log at debug level")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Parse a query and print its syntax tree")]
    Parse { query: String },

    #[command(about = "Compile a query and print its plan")]
    Explain {
        query: String,

        #[arg(long, help = "Hide literal values")]
        redact: bool,
    },

    #[command(about = "Run a query over entities loaded from a JSON array")]
    Run {
        query: String,

        #[arg(long, value_name = "FILE", help = "JSON array of entities with numeric ids")]
        data: PathBuf,

        #[arg(long, help = "Page size")]
        limit: Option<usize>,

        #[arg(long, value_name = "TOKEN", help = "Resume from a previous page")]
        cursor: Option<String>,

        #[arg(long, help = "Scan ids in descending order")]
        desc: bool,
    },

    #[command(about = "Print the effective configuration")]
    Config,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = QuarryConfig::load(cli.config.clone())?;

    match cli.command {
        Command::Parse { query } => {
            let ast = parse(&query).map_err(|err| ErrorWithCode::parse(&err).to_string())?;
            let out = json!({ "query": query, "ast": ast.to_string() });
            emit(&cli.format, &out, || println!("{ast}"))?;
        }
        Command::Explain { query, redact } => {
            let plan = compile(&query)?;
            let tree = plan.explain.render(redact);
            let out = json!({
                "plan_hash": format!("{:016x}", plan.plan_hash),
                "plan": tree,
                "tree": plan.explain.to_json(),
            });
            emit(&cli.format, &out, || {
                print!("{tree}");
                println!("plan_hash: {:016x}", plan.plan_hash);
            })?;
        }
        Command::Run {
            query,
            data,
            limit,
            cursor,
            desc,
        } => {
            let plan = compile(&query)?;
            let store = Arc::new(load_entities(&data)?);
            let mut request = PageRequest {
                limit,
                cursor,
                ..PageRequest::default()
            };
            if desc {
                request = request.descending();
            }
            let (records, cursor) = if plan.sort.is_empty() {
                scan_page(&plan, store, &config, &request).await?
            } else {
                sorted_page(&plan, store, &config, &request).await?
            };
            let out = json!({ "records": records, "cursor": cursor });
            emit(&cli.format, &out, || {
                for record in &records {
                    println!("{record}");
                }
                if let Some(cursor) = &cursor {
                    println!("cursor: {cursor}");
                }
            })?;
        }
        Command::Config => {
            let text = config.to_toml()?;
            let source = cli.config.clone().or_else(default_config_path);
            let out = json!({
                "path": source.map(|p| p.display().to_string()),
                "config": config,
            });
            emit(&cli.format, &out, || print!("{text}"))?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 {
        "quarry=debug"
    } else {
        "quarry=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn compile(query: &str) -> Result<QueryPlan, Box<dyn Error>> {
    let ast = parse(query).map_err(|err| ErrorWithCode::parse(&err).to_string())?;
    let plan = Compiler::default()
        .plan(&ast)
        .map_err(|err| ErrorWithCode::compile(&err).to_string())?;
    Ok(plan)
}

type RecordPage = (Vec<Value>, Option<String>);

/// Pages through range scans over the loaded entities.
async fn scan_page(
    plan: &QueryPlan,
    store: Arc<MemoryStore>,
    config: &QuarryConfig,
    request: &PageRequest,
) -> Result<RecordPage, Box<dyn Error>> {
    let executor = Executor::new(store.clone(), config.query.clone()).with_geo(store.clone());
    let page = executor.page(plan, request).await?;
    let records = page
        .ids
        .iter()
        .filter_map(|id| store.get(*id))
        .filter_map(|record| match record.body {
            RecordBody::Payload(payload) => Some(project(&payload, &plan.projection)),
            RecordBody::Tombstone => None,
        })
        .collect();
    Ok((records, page.cursor))
}

/// Indexes the loaded entities and serves `order by` queries through a
/// reconciled search.
async fn sorted_page(
    plan: &QueryPlan,
    store: Arc<MemoryStore>,
    config: &QuarryConfig,
    request: &PageRequest,
) -> Result<RecordPage, Box<dyn Error>> {
    let scope = SearchScope::new("cli", "data");
    let index = Arc::new(MemorySearchIndex::new());
    for id in store.ids() {
        if let Some(record) = store.get(id) {
            if let RecordBody::Payload(payload) = &record.body {
                index.index(&scope, id, record.version, payload).await?;
            }
        }
    }
    let reconciler = Reconciler::new(store, index)
        .with_config(config.query.clone(), config.reconcile.clone());
    let page = reconciler.search(plan, &scope, request).await?;
    let records = page.records.into_iter().map(|r| r.payload).collect();
    Ok((records, page.cursor))
}

fn load_entities(path: &Path) -> Result<MemoryStore, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let entities: Vec<Value> = serde_json::from_str(&text)?;
    let store = MemoryStore::new();
    for (idx, entity) in entities.into_iter().enumerate() {
        let id = entity
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("entity {idx} has no numeric id"))?;
        let version = entity.get("version").and_then(Value::as_u64).unwrap_or(1);
        store.insert(EntityId(id), Version(version), entity);
    }
    debug!(path = %path.display(), entities = store.len(), "loaded data file");
    Ok(store)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
