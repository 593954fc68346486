#![forbid(unsafe_code)]

//! Verification of secondary-index candidates against the primary store.
//!
//! The index is advisory. A candidate is surfaced only when the primary store
//! holds a live record at exactly the candidate's version. Entries the store
//! has moved past are de-indexed as a side effect of the read; entries the
//! store has not caught up with are left alone for read repair.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{QueryConfig, ReconcileConfig};
use crate::query::ast::Selection;
use crate::query::compiler::QueryPlan;
use crate::query::executor::PageRequest;
use crate::query::sort::RowPosition;
use crate::storage::{
    field_at, Candidate, CandidateQuery, DeindexEntry, EntityStore, RecordBody, SearchIndex,
    SearchScope,
};
use crate::types::{EntityId, Result, Version};

/// Candidate confirmed against the primary store.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedRecord {
    /// Entity id.
    pub id: EntityId,
    /// Version confirmed by the primary store.
    pub version: Version,
    /// Authoritative payload, projected when the query selected fields.
    pub payload: Value,
    /// Distance from the query centre for geo searches.
    pub distance: Option<f64>,
}

/// How candidates were classified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Versions matched; surfaced.
    pub accepted: usize,
    /// No authoritative record; dropped.
    pub missing: usize,
    /// Authoritative record newer or deleted; de-indexed and dropped.
    pub stale: usize,
    /// Index ahead of the primary store; dropped.
    pub ahead: usize,
}

impl ReconcileStats {
    fn add(&mut self, other: ReconcileStats) {
        self.accepted += other.accepted;
        self.missing += other.missing;
        self.stale += other.stale;
        self.ahead += other.ahead;
    }
}

/// Output of one reconcile call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reconciled {
    /// Accepted records in candidate order.
    pub records: Vec<VerifiedRecord>,
    /// Classification counts.
    pub stats: ReconcileStats,
}

/// Page of verified search results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchPage {
    /// Verified records in search order.
    pub records: Vec<VerifiedRecord>,
    /// Present while the index may hold further candidates.
    pub cursor: Option<String>,
    /// Totals over every candidate page read.
    pub stats: ReconcileStats,
    /// Candidate pages pulled from the index.
    pub candidate_pages: usize,
}

/// Reconciles candidates from a search index with the primary store.
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    index: Arc<dyn SearchIndex>,
    query: QueryConfig,
    config: ReconcileConfig,
}

impl Reconciler {
    /// Reconciler with default limits.
    pub fn new(store: Arc<dyn EntityStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            store,
            index,
            query: QueryConfig::default(),
            config: ReconcileConfig::default(),
        }
    }

    /// Replaces the paging and candidate limits.
    pub fn with_config(mut self, query: QueryConfig, config: ReconcileConfig) -> Self {
        self.query = query;
        self.config = config;
        self
    }

    /// Classifies `candidates` against one batch load of their records.
    /// Stale entries are de-indexed in a single batch before returning.
    pub async fn reconcile(
        &self,
        candidates: &[Candidate],
        scope: &SearchScope,
    ) -> Result<Reconciled> {
        if candidates.is_empty() {
            return Ok(Reconciled::default());
        }
        let mut seen = HashSet::with_capacity(candidates.len());
        let ids: Vec<EntityId> = candidates
            .iter()
            .map(|c| c.id)
            .filter(|id| seen.insert(*id))
            .collect();
        let records = self.store.load_batch(&ids).await?;

        let mut out = Reconciled::default();
        let mut deindex: Vec<DeindexEntry> = Vec::new();
        for candidate in candidates {
            let Some(record) = records.get(&candidate.id) else {
                warn!(
                    collection = %scope.collection,
                    id = candidate.id.0,
                    version = candidate.version.0,
                    "candidate has no authoritative record; possible replication lag, ignoring"
                );
                out.stats.missing += 1;
                continue;
            };
            if record.version > candidate.version || record.is_tombstone() {
                debug!(
                    collection = %scope.collection,
                    id = candidate.id.0,
                    indexed = candidate.version.0,
                    current = record.version.0,
                    "de-indexing stale candidate"
                );
                let entry = DeindexEntry {
                    id: candidate.id,
                    version: candidate.version,
                };
                if !deindex.contains(&entry) {
                    deindex.push(entry);
                }
                out.stats.stale += 1;
                continue;
            }
            if candidate.version > record.version {
                warn!(
                    collection = %scope.collection,
                    id = candidate.id.0,
                    indexed = candidate.version.0,
                    current = record.version.0,
                    "index is ahead of the primary store; repair needed"
                );
                out.stats.ahead += 1;
                continue;
            }
            if let RecordBody::Payload(payload) = &record.body {
                out.stats.accepted += 1;
                out.records.push(VerifiedRecord {
                    id: record.id,
                    version: record.version,
                    payload: payload.clone(),
                    distance: candidate.distance,
                });
            }
        }

        if !deindex.is_empty() {
            self.index.deindex(scope, &deindex).await?;
        }
        debug!(
            collection = %scope.collection,
            candidates = candidates.len(),
            accepted = out.stats.accepted,
            missing = out.stats.missing,
            stale = out.stats.stale,
            ahead = out.stats.ahead,
            "reconciled candidates"
        );
        Ok(out)
    }

    /// Pulls candidate pages for `plan` and reconciles them until the page
    /// is full, the index runs dry or `max_candidate_pages` were read.
    ///
    /// Candidate pages are read by rows. The cursor records the last row
    /// consumed, so versions of one id split across candidate pages are all
    /// seen, and results follow the plan's `order by` terms when it has any.
    pub async fn search(
        &self,
        plan: &QueryPlan,
        scope: &SearchScope,
        request: &PageRequest,
    ) -> Result<SearchPage> {
        let resolved = request.resolve(plan.plan_hash, &self.query)?;
        let mut page = SearchPage::default();
        let mut after = resolved.resume_row();
        let mut more = true;

        while more
            && page.records.len() < resolved.limit
            && page.candidate_pages < self.config.max_candidate_pages
        {
            let query = CandidateQuery {
                filter: &plan.root,
                sort: &plan.sort,
                order: resolved.order,
                after: after.as_ref(),
                limit: resolved.limit,
            };
            let candidates = self.index.search(scope, &query).await?;
            page.candidate_pages += 1;
            more = candidates.len() == resolved.limit;

            let reconciled = self.reconcile(&candidates, scope).await?;
            page.stats.add(reconciled.stats);
            let wanted = resolved.limit - page.records.len();
            if reconciled.records.len() > wanted {
                // page filled mid-batch; resume after the last record handed out
                let kept: Vec<VerifiedRecord> =
                    reconciled.records.into_iter().take(wanted).collect();
                after = kept
                    .last()
                    .and_then(|last| row_of(&candidates, last))
                    .or(after);
                page.records.extend(kept);
                more = true;
            } else {
                page.records.extend(reconciled.records);
                if let Some(last) = candidates.last() {
                    after = Some(last.position());
                }
            }
        }

        for record in page.records.iter_mut() {
            record.payload = project(&record.payload, &plan.projection);
        }
        page.cursor = match (more, after) {
            (true, Some(row)) => Some(resolved.cursor_at(row)?),
            _ => None,
        };
        debug!(
            plan_hash = plan.plan_hash,
            returned = page.records.len(),
            candidate_pages = page.candidate_pages,
            "search page verified"
        );
        Ok(page)
    }
}

/// Row position of the candidate `record` was accepted from.
fn row_of(candidates: &[Candidate], record: &VerifiedRecord) -> Option<RowPosition> {
    candidates
        .iter()
        .find(|c| c.id == record.id && c.version == record.version)
        .map(Candidate::position)
}

/// Copies the selected fields of `payload`. Dotted paths copy the nested
/// field and the objects leading to it.
pub fn project(payload: &Value, selection: &Selection) -> Value {
    let Selection::Fields(fields) = selection else {
        return payload.clone();
    };
    let mut out = Map::new();
    for path in fields {
        if let Some(value) = field_at(payload, path) {
            insert_path(&mut out, path, value.clone());
        }
    }
    Value::Object(out)
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_owned(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}
