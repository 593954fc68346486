//! In-memory edge and edge-metadata stores with mutation counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AppScope, Dir, EdgeMetadataSerialization, EdgeSerialization, MarkedEdge, NodeRef};
use crate::types::{QuarryError, Result};

type EdgeKey = (AppScope, NodeRef, String, NodeRef);

/// Edge versions per (scope, source, type, target), keyed by timestamp.
#[derive(Default)]
pub struct MemoryEdgeStore {
    edges: RwLock<BTreeMap<EdgeKey, BTreeMap<u64, bool>>>,
    mutations: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryEdgeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes and deletes applied so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Total stored versions across all edges.
    pub fn version_count(&self) -> usize {
        self.edges.read().values().map(BTreeMap::len).sum()
    }

    /// Makes every call fail with a retriable storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QuarryError::Storage("edge store marked unavailable".into()));
        }
        Ok(())
    }
}

fn edge_key(scope: &AppScope, edge: &MarkedEdge) -> EdgeKey {
    (
        scope.clone(),
        edge.source.clone(),
        edge.edge_type.clone(),
        edge.target.clone(),
    )
}

#[async_trait]
impl EdgeSerialization for MemoryEdgeStore {
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.check_available()?;
        self.edges
            .write()
            .entry(edge_key(scope, edge))
            .or_default()
            .insert(edge.timestamp, edge.deleted);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.check_available()?;
        let key = edge_key(scope, edge);
        let mut edges = self.edges.write();
        if let Some(versions) = edges.get_mut(&key) {
            if versions.remove(&edge.timestamp).is_some() {
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
            if versions.is_empty() {
                edges.remove(&key);
            }
        }
        Ok(())
    }

    async fn edge_versions(
        &self,
        scope: &AppScope,
        source: &NodeRef,
        edge_type: &str,
        target: &NodeRef,
        max_timestamp: u64,
    ) -> Result<Vec<MarkedEdge>> {
        self.check_available()?;
        let key = (
            scope.clone(),
            source.clone(),
            edge_type.to_owned(),
            target.clone(),
        );
        let edges = self.edges.read();
        Ok(edges
            .get(&key)
            .map(|versions| {
                versions
                    .range(..=max_timestamp)
                    .rev()
                    .map(|(timestamp, deleted)| MarkedEdge {
                        source: source.clone(),
                        edge_type: edge_type.to_owned(),
                        target: target.clone(),
                        timestamp: *timestamp,
                        deleted: *deleted,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn live_edges_by_id_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        id_type: &str,
        max_timestamp: u64,
        limit: usize,
    ) -> Result<Vec<MarkedEdge>> {
        self.check_available()?;
        let edges = self.edges.read();
        let mut out = Vec::new();
        for ((edge_scope, source, ty, target), versions) in edges.iter() {
            if out.len() == limit {
                break;
            }
            let (near, far) = match dir {
                Dir::Out => (source, target),
                Dir::In => (target, source),
            };
            if edge_scope != scope || near != node || ty != edge_type || far.kind != id_type {
                continue;
            }
            // the newest version at or before the bound decides liveness
            if let Some((timestamp, false)) = versions.range(..=max_timestamp).next_back() {
                out.push(MarkedEdge {
                    source: source.clone(),
                    edge_type: ty.clone(),
                    target: target.clone(),
                    timestamp: *timestamp,
                    deleted: false,
                });
            }
        }
        Ok(out)
    }
}

type MetaKey = (AppScope, NodeRef, Dir);

#[derive(Default)]
struct TypeEntry {
    timestamp: u64,
    id_types: BTreeMap<String, u64>,
}

/// Edge-type and id-type bookkeeping per node and direction.
#[derive(Default)]
pub struct MemoryEdgeMetadata {
    entries: RwLock<HashMap<MetaKey, BTreeMap<String, TypeEntry>>>,
    mutations: AtomicUsize,
}

impl MemoryEdgeMetadata {
    /// Empty metadata store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes and removals applied so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn record(&self, key: MetaKey, edge_type: &str, id_type: &str, timestamp: u64) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key)
            .or_default()
            .entry(edge_type.to_owned())
            .or_default();
        entry.timestamp = entry.timestamp.max(timestamp);
        let id_ts = entry.id_types.entry(id_type.to_owned()).or_insert(timestamp);
        *id_ts = (*id_ts).max(timestamp);
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

fn meta_key(scope: &AppScope, node: &NodeRef, dir: Dir) -> MetaKey {
    (scope.clone(), node.clone(), dir)
}

#[async_trait]
impl EdgeMetadataSerialization for MemoryEdgeMetadata {
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.record(
            meta_key(scope, &edge.source, Dir::Out),
            &edge.edge_type,
            &edge.target.kind,
            edge.timestamp,
        );
        self.record(
            meta_key(scope, &edge.target, Dir::In),
            &edge.edge_type,
            &edge.source.kind,
            edge.timestamp,
        );
        Ok(())
    }

    async fn edge_types(&self, scope: &AppScope, node: &NodeRef, dir: Dir) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .get(&meta_key(scope, node, dir))
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn id_types(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .get(&meta_key(scope, node, dir))
            .and_then(|types| types.get(edge_type))
            .map(|entry| entry.id_types.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_id_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        id_type: &str,
        max_timestamp: u64,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let Some(entry) = entries
            .get_mut(&meta_key(scope, node, dir))
            .and_then(|types| types.get_mut(edge_type))
        else {
            return Ok(());
        };
        if entry.id_types.get(id_type).map_or(false, |ts| *ts <= max_timestamp) {
            entry.id_types.remove(id_type);
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove_edge_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        max_timestamp: u64,
    ) -> Result<()> {
        let key = meta_key(scope, node, dir);
        let mut entries = self.entries.write();
        let Some(types) = entries.get_mut(&key) else {
            return Ok(());
        };
        if types.get(edge_type).map_or(false, |entry| entry.timestamp <= max_timestamp) {
            types.remove(edge_type);
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        if types.is_empty() {
            entries.remove(&key);
        }
        Ok(())
    }
}
