//! Repairs that reconcile long-term edge storage and edge metadata with the
//! commit log.
//!
//! Each storage call acts on one edge version or one metadata entry, so a
//! failed repair can be rerun from the start.

use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use tracing::{debug, info};

use super::{AppScope, Dir, EdgeMetadataSerialization, EdgeSerialization, MarkedEdge, NodeRef};
use crate::config::RepairConfig;
use crate::types::{QuarryError, Result};

/// Outcome of [`EdgeRepair::repair_delete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteRepair {
    /// The commit log does not mark the edge deleted at that timestamp;
    /// nothing was touched.
    NotMarkedDeleted,
    /// Storage versions were removed and the commit-log entry trimmed.
    Repaired {
        /// Storage versions deleted.
        removed: usize,
    },
}

/// Runs `op` over `items` with at most `window` calls in flight and returns
/// the results in input order. The first failure ends the run: calls in
/// flight are dropped and the remaining items are never started.
async fn bounded<T, F, Fut, R>(items: Vec<T>, window: usize, op: F) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let calls = items.into_iter().enumerate().map(|(idx, item)| {
        let fut = op(item);
        Ok::<_, QuarryError>(async move { fut.await.map(|result| (idx, result)) })
    });
    let mut completed: Vec<(usize, R)> = stream::iter(calls)
        .try_buffer_unordered(window.max(1))
        .try_collect()
        .await?;
    completed.sort_by_key(|(idx, _)| *idx);
    Ok(completed.into_iter().map(|(_, result)| result).collect())
}

/// Write and delete repair between the commit log and storage.
pub struct EdgeRepair {
    commit_log: Arc<dyn EdgeSerialization>,
    storage: Arc<dyn EdgeSerialization>,
    config: RepairConfig,
}

impl EdgeRepair {
    /// Repairs `storage` against `commit_log`.
    pub fn new(
        commit_log: Arc<dyn EdgeSerialization>,
        storage: Arc<dyn EdgeSerialization>,
        config: RepairConfig,
    ) -> Self {
        Self {
            commit_log,
            storage,
            config,
        }
    }

    /// Deletes every stored version of `keep`'s edge older than `keep`,
    /// newest first. Returns how many were deleted.
    pub async fn repair_write(&self, scope: &AppScope, keep: &MarkedEdge) -> Result<usize> {
        let older: Vec<MarkedEdge> = self
            .storage
            .edge_versions(scope, &keep.source, &keep.edge_type, &keep.target, u64::MAX)
            .await?
            .into_iter()
            .skip_while(|version| version.timestamp >= keep.timestamp)
            .collect();
        let removed = self.delete_versions(scope, older).await?;
        debug!(edge = %keep, removed, "write repair complete");
        Ok(removed)
    }

    /// Removes the stored versions of an edge the commit log marks deleted
    /// at `edge.timestamp`, then trims that commit-log entry.
    pub async fn repair_delete(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<DeleteRepair> {
        let marked = self
            .commit_log
            .edge_versions(scope, &edge.source, &edge.edge_type, &edge.target, edge.timestamp)
            .await?
            .into_iter()
            .find(|version| version.timestamp == edge.timestamp && version.deleted);
        let Some(marked) = marked else {
            debug!(edge = %edge, "commit log does not mark edge deleted; skipping");
            return Ok(DeleteRepair::NotMarkedDeleted);
        };

        let stored = self
            .storage
            .edge_versions(scope, &edge.source, &edge.edge_type, &edge.target, edge.timestamp)
            .await?;
        let removed = self.delete_versions(scope, stored).await?;
        self.commit_log.delete_edge(scope, &marked).await?;
        info!(edge = %edge, removed, "delete repair complete");
        Ok(DeleteRepair::Repaired { removed })
    }

    async fn delete_versions(&self, scope: &AppScope, versions: Vec<MarkedEdge>) -> Result<usize> {
        let storage = &self.storage;
        let deleted = bounded(versions, self.config.batch_size, |version| async move {
            storage.delete_edge(scope, &version).await
        })
        .await?;
        Ok(deleted.len())
    }
}

/// Drops edge metadata entries no live edge backs any more.
pub struct EdgeMetaRepair {
    storage: Arc<dyn EdgeSerialization>,
    meta: Arc<dyn EdgeMetadataSerialization>,
    config: RepairConfig,
}

impl EdgeMetaRepair {
    /// Repairs `meta` against the live edges in `storage`.
    pub fn new(
        storage: Arc<dyn EdgeSerialization>,
        meta: Arc<dyn EdgeMetadataSerialization>,
        config: RepairConfig,
    ) -> Self {
        Self {
            storage,
            meta,
            config,
        }
    }

    /// Repairs the metadata of `edge_type` edges leaving `source`. Returns
    /// the number of target id types still in use.
    pub async fn repair_sources(
        &self,
        scope: &AppScope,
        source: &NodeRef,
        edge_type: &str,
        max_timestamp: u64,
    ) -> Result<usize> {
        self.repair(scope, source, Dir::Out, edge_type, max_timestamp)
            .await
    }

    /// Repairs the metadata of `edge_type` edges arriving at `target`.
    /// Returns the number of source id types still in use.
    pub async fn repair_targets(
        &self,
        scope: &AppScope,
        target: &NodeRef,
        edge_type: &str,
        max_timestamp: u64,
    ) -> Result<usize> {
        self.repair(scope, target, Dir::In, edge_type, max_timestamp)
            .await
    }

    async fn repair(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        max_timestamp: u64,
    ) -> Result<usize> {
        let id_types = self.meta.id_types(scope, node, dir, edge_type).await?;
        let storage = &self.storage;
        let meta = &self.meta;
        let in_use = bounded(id_types, self.config.batch_size, |id_type| async move {
            let live = storage
                .live_edges_by_id_type(scope, node, dir, edge_type, &id_type, max_timestamp, 1)
                .await?;
            if !live.is_empty() {
                return Ok(1usize);
            }
            debug!(node = %node, ?dir, edge_type, id_type = %id_type, "removing unused id type");
            meta.remove_id_type(scope, node, dir, edge_type, &id_type, max_timestamp)
                .await?;
            Ok::<usize, QuarryError>(0)
        })
        .await?
        .into_iter()
        .sum::<usize>();

        if in_use == 0 {
            let recorded = self.meta.edge_types(scope, node, dir).await?;
            if recorded.iter().any(|ty| ty == edge_type) {
                info!(node = %node, ?dir, edge_type, "removing unused edge type");
                self.meta
                    .remove_edge_type(scope, node, dir, edge_type, max_timestamp)
                    .await?;
            }
        }
        Ok(in_use)
    }
}
