#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use quarry::config::RepairConfig;
use quarry::graph::{
    AppScope, Dir, EdgeMetaRepair, EdgeMetadataSerialization, EdgeRepair, EdgeSerialization,
    MarkedEdge, MemoryEdgeMetadata, MemoryEdgeStore, NodeRef,
};
use quarry::types::{QuarryError, Result};

fn scope() -> AppScope {
    AppScope::new("app")
}

fn owns(target: u64, timestamp: u64) -> MarkedEdge {
    MarkedEdge::new(NodeRef::new(1, "user"), "owns", NodeRef::new(target, "car"), timestamp)
}

async fn stored_timestamps(store: &MemoryEdgeStore, edge: &MarkedEdge) -> Result<Vec<u64>> {
    Ok(store
        .edge_versions(&scope(), &edge.source, &edge.edge_type, &edge.target, u64::MAX)
        .await?
        .into_iter()
        .map(|e| e.timestamp)
        .collect())
}

/// Edge store that records how many deletes run at once.
struct InFlightStore {
    inner: MemoryEdgeStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl EdgeSerialization for InFlightStore {
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.inner.write_edge(scope, edge).await
    }

    async fn delete_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = self.inner.delete_edge(scope, edge).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn edge_versions(
        &self,
        scope: &AppScope,
        source: &NodeRef,
        edge_type: &str,
        target: &NodeRef,
        max_timestamp: u64,
    ) -> Result<Vec<MarkedEdge>> {
        self.inner
            .edge_versions(scope, source, edge_type, target, max_timestamp)
            .await
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
        self.inner
            .live_edges_by_id_type(scope, node, dir, edge_type, id_type, max_timestamp, limit)
            .await
    }
}

/// Edge store whose deletes always fail, counting the attempts.
struct RejectingStore {
    inner: MemoryEdgeStore,
    delete_attempts: AtomicUsize,
}

#[async_trait]
impl EdgeSerialization for RejectingStore {
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.inner.write_edge(scope, edge).await
    }

    async fn delete_edge(&self, _scope: &AppScope, edge: &MarkedEdge) -> Result<()> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        Err(QuarryError::Storage(format!("delete of {edge} rejected")))
    }

    async fn edge_versions(
        &self,
        scope: &AppScope,
        source: &NodeRef,
        edge_type: &str,
        target: &NodeRef,
        max_timestamp: u64,
    ) -> Result<Vec<MarkedEdge>> {
        self.inner
            .edge_versions(scope, source, edge_type, target, max_timestamp)
            .await
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
        self.inner
            .live_edges_by_id_type(scope, node, dir, edge_type, id_type, max_timestamp, limit)
            .await
    }
}

#[tokio::test]
async fn write_repair_keeps_the_chosen_version_and_newer() -> Result<()> {
    let storage = Arc::new(MemoryEdgeStore::new());
    let versions: Vec<MarkedEdge> = (1..=11).map(|ts| owns(2, ts)).collect();
    for edge in &versions {
        storage.write_edge(&scope(), edge).await?;
    }
    let keep = &versions[5];

    let repair = EdgeRepair::new(
        Arc::new(MemoryEdgeStore::new()),
        storage.clone(),
        RepairConfig::default(),
    );
    assert_eq!(repair.repair_write(&scope(), keep).await?, 5);
    assert_eq!(
        stored_timestamps(&storage, keep).await?,
        vec![11, 10, 9, 8, 7, 6]
    );

    assert_eq!(repair.repair_write(&scope(), keep).await?, 0);
    Ok(())
}

#[tokio::test]
async fn write_repair_never_exceeds_the_batch_window() -> Result<()> {
    let storage = Arc::new(InFlightStore {
        inner: MemoryEdgeStore::new(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    for ts in 1..=20 {
        storage.write_edge(&scope(), &owns(2, ts)).await?;
    }

    let repair = EdgeRepair::new(
        Arc::new(MemoryEdgeStore::new()),
        storage.clone(),
        RepairConfig { batch_size: 3 },
    );
    assert_eq!(repair.repair_write(&scope(), &owns(2, 20)).await?, 19);
    let peak = storage.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak} exceeded the window");
    assert!(peak > 1, "deletes never overlapped");
    assert_eq!(storage.inner.version_count(), 1);
    Ok(())
}

#[tokio::test]
async fn meta_repair_clears_metadata_once_every_edge_is_deleted() -> Result<()> {
    let storage = Arc::new(MemoryEdgeStore::new());
    let meta = Arc::new(MemoryEdgeMetadata::new());
    for target in [2, 3] {
        let edge = owns(target, 10);
        storage.write_edge(&scope(), &edge).await?;
        meta.write_edge(&scope(), &edge).await?;
        storage.write_edge(&scope(), &edge.deleted_at(20)).await?;
    }
    let source = NodeRef::new(1, "user");

    let repair = EdgeMetaRepair::new(storage, meta.clone(), RepairConfig::default());
    assert_eq!(repair.repair_sources(&scope(), &source, "owns", 30).await?, 0);
    assert!(meta.edge_types(&scope(), &source, Dir::Out).await?.is_empty());

    let before = meta.mutations();
    assert_eq!(repair.repair_sources(&scope(), &source, "owns", 30).await?, 0);
    assert_eq!(meta.mutations(), before);
    Ok(())
}

#[tokio::test]
async fn meta_repair_keeps_types_with_live_edges() -> Result<()> {
    let storage = Arc::new(MemoryEdgeStore::new());
    let meta = Arc::new(MemoryEdgeMetadata::new());
    let live = owns(2, 10);
    let dead = MarkedEdge::new(NodeRef::new(4, "shop"), "owns", NodeRef::new(2, "car"), 10);
    for edge in [&live, &dead] {
        storage.write_edge(&scope(), edge).await?;
        meta.write_edge(&scope(), edge).await?;
    }
    storage.write_edge(&scope(), &dead.deleted_at(15)).await?;

    let repair = EdgeMetaRepair::new(storage, meta.clone(), RepairConfig { batch_size: 1 });
    let target = NodeRef::new(2, "car");
    assert_eq!(repair.repair_targets(&scope(), &target, "owns", 30).await?, 1);
    assert_eq!(
        meta.id_types(&scope(), &target, Dir::In, "owns").await?,
        vec!["user".to_string()]
    );
    assert_eq!(
        meta.edge_types(&scope(), &target, Dir::In).await?,
        vec!["owns".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn meta_repair_leaves_entries_written_after_the_bound() -> Result<()> {
    let storage = Arc::new(MemoryEdgeStore::new());
    let meta = Arc::new(MemoryEdgeMetadata::new());
    meta.write_edge(&scope(), &owns(2, 50)).await?;
    let source = NodeRef::new(1, "user");

    let repair = EdgeMetaRepair::new(storage, meta.clone(), RepairConfig::default());
    assert_eq!(repair.repair_sources(&scope(), &source, "owns", 40).await?, 0);
    assert_eq!(
        meta.id_types(&scope(), &source, Dir::Out, "owns").await?,
        vec!["car".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn write_repair_stops_issuing_deletes_after_a_failure() -> Result<()> {
    let storage = Arc::new(RejectingStore {
        inner: MemoryEdgeStore::new(),
        delete_attempts: AtomicUsize::new(0),
    });
    for ts in 1..=6 {
        storage.write_edge(&scope(), &owns(2, ts)).await?;
    }

    let repair = EdgeRepair::new(
        Arc::new(MemoryEdgeStore::new()),
        storage.clone(),
        RepairConfig { batch_size: 2 },
    );
    let err = repair
        .repair_write(&scope(), &owns(2, 6))
        .await
        .expect_err("deletes rejected");
    assert!(err.is_retriable());
    assert!(
        storage.delete_attempts.load(Ordering::SeqCst) <= 2,
        "deletes kept running after the first failure"
    );
    assert_eq!(storage.inner.version_count(), 6);
    Ok(())
}
