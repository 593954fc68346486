//! Graph edges kept in a commit log and in long-term storage, plus the
//! repairs that bring the two (and the edge metadata) back into agreement.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Result};

/// In-memory edge and metadata stores.
pub mod memory;
/// Write, delete and metadata repair.
pub mod repair;

pub use memory::{MemoryEdgeMetadata, MemoryEdgeStore};
pub use repair::{DeleteRepair, EdgeMetaRepair, EdgeRepair};

/// Tenant the edges belong to.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AppScope {
    /// Application name.
    pub application: String,
}

impl AppScope {
    /// Scope for `application`.
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
        }
    }
}

/// Node reference: an id plus the type of entity it names.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Entity id.
    pub id: EntityId,
    /// Entity type, the edge's id type.
    pub kind: String,
}

impl NodeRef {
    /// Reference to entity `id` of type `kind`.
    pub fn new(id: u64, kind: impl Into<String>) -> Self {
        Self {
            id: EntityId(id),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Edge direction relative to a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Edges whose source is the node.
    Out,
    /// Edges whose target is the node.
    In,
}

/// One version of an edge.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkedEdge {
    /// Node the edge starts at.
    pub source: NodeRef,
    /// Relationship name.
    pub edge_type: String,
    /// Node the edge points to.
    pub target: NodeRef,
    /// Version timestamp; larger is newer.
    pub timestamp: u64,
    /// Whether this version marks the edge deleted.
    pub deleted: bool,
}

impl MarkedEdge {
    /// Live edge version at `timestamp`.
    pub fn new(
        source: NodeRef,
        edge_type: impl Into<String>,
        target: NodeRef,
        timestamp: u64,
    ) -> Self {
        Self {
            source,
            edge_type: edge_type.into(),
            target,
            timestamp,
            deleted: false,
        }
    }

    /// Same edge at `timestamp`, marked deleted.
    pub fn deleted_at(&self, timestamp: u64) -> Self {
        Self {
            timestamp,
            deleted: true,
            ..self.clone()
        }
    }

    /// The node at the far end when read from `dir`.
    pub fn far_end(&self, dir: Dir) -> &NodeRef {
        match dir {
            Dir::Out => &self.target,
            Dir::In => &self.source,
        }
    }
}

impl fmt::Display for MarkedEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}@{}{}]-> {}",
            self.source,
            self.edge_type,
            self.timestamp,
            if self.deleted { " deleted" } else { "" },
            self.target
        )
    }
}

/// Edge versions keyed by (source, type, target, timestamp). The commit
/// log and long-term storage share this interface.
#[async_trait]
pub trait EdgeSerialization: Send + Sync {
    /// Stores one edge version.
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()>;

    /// Removes exactly the version identified by `edge`.
    async fn delete_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()>;

    /// Versions of one edge with `timestamp <= max_timestamp`, newest first.
    async fn edge_versions(
        &self,
        scope: &AppScope,
        source: &NodeRef,
        edge_type: &str,
        target: &NodeRef,
        max_timestamp: u64,
    ) -> Result<Vec<MarkedEdge>>;

    /// Up to `limit` edges of `edge_type` in `dir` from `node` whose far end
    /// has kind `id_type`, not marked deleted and with
    /// `timestamp <= max_timestamp`.
    async fn live_edges_by_id_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        id_type: &str,
        max_timestamp: u64,
        limit: usize,
    ) -> Result<Vec<MarkedEdge>>;
}

/// Which edge types and far-end id types are recorded per node and direction.
#[async_trait]
pub trait EdgeMetadataSerialization: Send + Sync {
    /// Records the edge's type and id types for both of its ends.
    async fn write_edge(&self, scope: &AppScope, edge: &MarkedEdge) -> Result<()>;

    /// Edge types recorded for `node` in `dir`.
    async fn edge_types(&self, scope: &AppScope, node: &NodeRef, dir: Dir) -> Result<Vec<String>>;

    /// Far-end id types recorded for (`node`, `dir`, `edge_type`).
    async fn id_types(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
    ) -> Result<Vec<String>>;

    /// Removes an id-type entry unless it was written after `max_timestamp`.
    async fn remove_id_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        id_type: &str,
        max_timestamp: u64,
    ) -> Result<()>;

    /// Removes an edge-type entry unless it was written after `max_timestamp`.
    async fn remove_edge_type(
        &self,
        scope: &AppScope,
        node: &NodeRef,
        dir: Dir,
        edge_type: &str,
        max_timestamp: u64,
    ) -> Result<()>;
}
