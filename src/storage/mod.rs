//! Storage boundary of the query core.
//!
//! The executor reads ordered id ranges through [`RangeScanner`] and
//! [`GeoIndex`]; the reconciler loads authoritative records through
//! [`EntityStore`] and talks to the secondary index through [`SearchIndex`].
//! All calls are async; a dropped future abandons the call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::query::cursor::ScanOrder;
use crate::query::ir::IrNode;
use crate::query::slice::QuerySlice;
use crate::query::sort::{RowPosition, SortKey, SortPredicate};
use crate::types::{EntityId, Result, ShardId, Version};

/// In-memory implementations backing tests and the CLI.
pub mod memory;

pub use memory::{MemorySearchIndex, MemoryStore};

/// Looks up a dotted path (`loc.city`) inside a JSON document.
pub fn field_at<'a>(doc: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(doc, |value, segment| value.as_object()?.get(segment))
}

/// Ordered, paged range scans over per-property shards.
#[async_trait]
pub trait RangeScanner: Send + Sync {
    /// Shards holding `property`'s range index.
    async fn shards(&self, property: &str) -> Result<Vec<ShardId>>;

    /// Up to `limit` ids from `shard` whose `slice.property` value lies in
    /// the slice range, strictly after `after`, ascending by id (descending
    /// when `slice.reversed`).
    async fn scan(
        &self,
        shard: ShardId,
        slice: &QuerySlice,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>>;
}

/// Radius queries over a geo-indexed property.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Up to `limit` ids within `query`, strictly after `after`, in `order`.
    async fn within(
        &self,
        query: &GeoQuery,
        order: ScanOrder,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>>;
}

/// Parameters of a radius query.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoQuery {
    /// Property holding `{latitude, longitude}`.
    pub property: String,
    /// Radius in metres.
    pub distance: f64,
    /// Latitude of the centre.
    pub lat: f64,
    /// Longitude of the centre.
    pub lon: f64,
}

/// Authoritative body of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordBody {
    /// Live entity fields.
    Payload(serde_json::Value),
    /// Deletion marker.
    Tombstone,
}

/// Current state of an entity in the primary store.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthoritativeRecord {
    /// Entity id.
    pub id: EntityId,
    /// Version the record was written at.
    pub version: Version,
    /// Fields or deletion marker.
    pub body: RecordBody,
}

impl AuthoritativeRecord {
    /// Whether the record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.body, RecordBody::Tombstone)
    }
}

/// Batch reads from the primary versioned store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Loads the current record of every id that exists; absent ids are
    /// simply missing from the map.
    async fn load_batch(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, AuthoritativeRecord>>;
}

/// Writes to the primary versioned store.
#[async_trait]
pub trait EntityWriter: Send + Sync {
    /// Stores `body` as the record for `id` at `version`. Older versions
    /// never overwrite newer ones.
    async fn write(&self, id: EntityId, version: Version, body: RecordBody) -> Result<()>;
}

/// Tenant/collection a search runs in.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SearchScope {
    /// Owning application.
    pub application: String,
    /// Collection within the application.
    pub collection: String,
}

impl SearchScope {
    /// Scope for `collection` of `application`.
    pub fn new(application: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            collection: collection.into(),
        }
    }
}

/// Unverified match reported by a secondary index: one indexed row.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Entity the row was indexed for.
    pub id: EntityId,
    /// Version the row was indexed at.
    pub version: Version,
    /// Distance from the query centre, for geo searches.
    pub distance: Option<f64>,
    /// Indexed values of the query's sort properties.
    pub sort_key: SortKey,
}

impl Candidate {
    /// Row for `id` at `version` with no distance or sort key.
    pub fn new(id: EntityId, version: Version) -> Self {
        Self {
            id,
            version,
            distance: None,
            sort_key: Vec::new(),
        }
    }

    /// Where this row sits in the search order.
    pub fn position(&self) -> RowPosition {
        RowPosition {
            key: self.sort_key.clone(),
            id: self.id,
            version: self.version,
        }
    }
}

/// Index entry to remove, identified by the version it was indexed at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DeindexEntry {
    /// Entity the entry was indexed for.
    pub id: EntityId,
    /// Version the entry was indexed at.
    pub version: Version,
}

/// One page of rows requested from a [`SearchIndex`].
#[derive(Clone, Copy, Debug)]
pub struct CandidateQuery<'a> {
    /// Compiled filter rows must match.
    pub filter: &'a IrNode,
    /// `order by` terms; rows follow id order when empty.
    pub sort: &'a [SortPredicate],
    /// Descending reverses the whole row order.
    pub order: ScanOrder,
    /// Rows up to and including this position are skipped.
    pub after: Option<&'a RowPosition>,
    /// Maximum number of rows to return.
    pub limit: usize,
}

/// Secondary search index. Its answers are advisory.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Up to `query.limit` rows matching `query.filter` in `scope`, strictly
    /// after `query.after`. The index holds one row per indexed version, so
    /// an id may appear several times and a page may end between two of its
    /// versions. Rows are ordered by sort key, then id, then version, and
    /// each row carries the sort key it was ordered by.
    async fn search(
        &self,
        scope: &SearchScope,
        query: &CandidateQuery<'_>,
    ) -> Result<Vec<Candidate>>;

    /// Indexes `payload` for `id` at `version`.
    async fn index(
        &self,
        scope: &SearchScope,
        id: EntityId,
        version: Version,
        payload: &serde_json::Value,
    ) -> Result<()>;

    /// Removes every listed entry in one batch.
    async fn deindex(&self, scope: &SearchScope, entries: &[DeindexEntry]) -> Result<()>;
}
