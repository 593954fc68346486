//! Runtime configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "QUARRY_CONFIG";

/// Query execution limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when a request names none.
    pub default_limit: usize,
    /// Upper bound on any page size.
    pub max_limit: usize,
    /// Ids fetched per storage round trip by each leaf scan.
    pub scan_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 1000,
            scan_page_size: 100,
        }
    }
}

/// Candidate reconciliation limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Candidate pages read from the search index to fill one result page.
    pub max_candidate_pages: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_candidate_pages: 8,
        }
    }
}

/// Graph repair fan-out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Storage operations in flight at once during a repair.
    pub batch_size: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Complete configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    /// `[query]` section.
    pub query: QueryConfig,
    /// `[reconcile]` section.
    pub reconcile: ReconcileConfig,
    /// `[repair]` section.
    pub repair: RepairConfig,
}

impl QuarryConfig {
    /// Loads the explicit path, else `$QUARRY_CONFIG`, else the per-user
    /// config file. Defaults apply when the chosen file does not exist.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);
        let config = match path.as_ref() {
            Some(path) if path.exists() => read_file(path)?,
            _ => QuarryConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: QuarryConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero sizes and a default page larger than the maximum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("query.default_limit", self.query.default_limit),
            ("query.max_limit", self.query.max_limit),
            ("query.scan_page_size", self.query.scan_page_size),
            ("reconcile.max_candidate_pages", self.reconcile.max_candidate_pages),
            ("repair.batch_size", self.repair.batch_size),
        ];
        if let Some((key, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                key: *key,
                reason: "must be greater than zero",
            });
        }
        if self.query.default_limit > self.query.max_limit {
            return Err(ConfigError::Invalid {
                key: "query.default_limit",
                reason: "must not exceed query.max_limit",
            });
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Writes the configuration to `target`, creating parent directories.
    pub fn persist(&self, target: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(target, self.to_toml()?).map_err(|source| ConfigError::Write {
            path: target.to_path_buf(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<QuarryConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Failures while loading, validating or saving configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config key {key} {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

/// Per-user config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("quarry").join("config.toml"))
}
