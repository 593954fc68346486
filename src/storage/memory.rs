//! In-memory stores.
//!
//! [`MemoryStore`] is the authoritative store, range scanner and geo index in
//! one; [`MemorySearchIndex`] is a secondary index that keeps one document
//! per indexed version and only changes when told to, so it can lag.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace};

use super::{
    field_at, AuthoritativeRecord, Candidate, CandidateQuery, DeindexEntry, EntityStore,
    EntityWriter, GeoIndex, GeoQuery, RangeScanner, RecordBody, SearchIndex, SearchScope,
};
use crate::query::cursor::ScanOrder;
use crate::query::ir::IrNode;
use crate::query::slice::{QuerySlice, RangeValue, SliceNode, ID_PROPERTY, KEYWORDS_SUFFIX};
use crate::query::sort::{SortKey, SortPredicate};
use crate::types::{EntityId, QuarryError, Result, ShardId, Version};

const EARTH_RADIUS_METRES: f64 = 6_371_000.0;
const DEFAULT_SHARDS: u32 = 4;

/// Values a slice over `property` sees for one entity. Ids above
/// `i64::MAX` have no literal form and are matched by [`id_matches`].
fn property_values(id: EntityId, payload: &Value, property: &str) -> Vec<RangeValue> {
    if property == ID_PROPERTY {
        return i64::try_from(id.0)
            .map(|v| vec![RangeValue::Int(v)])
            .unwrap_or_default();
    }
    if let Some(base) = property.strip_suffix(KEYWORDS_SUFFIX) {
        return field_at(payload, base)
            .map(keywords)
            .unwrap_or_default();
    }
    match field_at(payload, property) {
        Some(Value::Array(items)) => items.iter().filter_map(RangeValue::from_json).collect(),
        Some(value) => RangeValue::from_json(value).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Lower-cased alphanumeric tokens of a string or array of strings.
fn keywords(value: &Value) -> Vec<RangeValue> {
    let texts: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    texts
        .into_iter()
        .flat_map(|text| text.split(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .map(|token| RangeValue::Str(token.to_lowercase()))
        .collect()
}

/// Range check on the id itself, compared as unsigned.
fn id_matches(slice: &QuerySlice, id: EntityId) -> bool {
    match i64::try_from(id.0) {
        Ok(v) => slice.matches(&RangeValue::Int(v)),
        // larger than any integer literal
        Err(_) => {
            let above_start = slice.start.as_ref().map_or(true, |start| {
                matches!(start.value, RangeValue::Int(_) | RangeValue::Float(_))
            });
            above_start && slice.finish.is_none()
        }
    }
}

fn slice_matches(slice: &QuerySlice, id: EntityId, payload: &Value) -> bool {
    if slice.property == ID_PROPERTY {
        return id_matches(slice, id);
    }
    property_values(id, payload, &slice.property)
        .iter()
        .any(|value| slice.matches(value))
}

fn node_matches(node: &SliceNode, id: EntityId, payload: &Value) -> bool {
    node.slices()
        .iter()
        .all(|slice| slice_matches(slice, id, payload))
}

/// Great-circle distance in metres from the query centre to the point
/// stored at `property`, if it holds one.
fn geo_distance(payload: &Value, property: &str, lat: f64, lon: f64) -> Option<f64> {
    let point = field_at(payload, property)?;
    let plat = point.get("latitude").or_else(|| point.get("lat"))?.as_f64()?;
    let plon = point.get("longitude").or_else(|| point.get("lon"))?.as_f64()?;
    let (phi1, phi2) = (lat.to_radians(), plat.to_radians());
    let dphi = (plat - lat).to_radians();
    let dlambda = (plon - lon).to_radians();
    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    Some(2.0 * EARTH_RADIUS_METRES * a.sqrt().atan2((1.0 - a).sqrt()))
}

/// Evaluates a compiled tree against one document.
pub fn matches_ir(node: &IrNode, id: EntityId, payload: &Value) -> bool {
    match node {
        IrNode::And(l, r) => matches_ir(l, id, payload) && matches_ir(r, id, payload),
        IrNode::Or(l, r) => matches_ir(l, id, payload) || matches_ir(r, id, payload),
        IrNode::Not { subtract, keep } => {
            node_matches(keep, id, payload) && !matches_ir(subtract, id, payload)
        }
        IrNode::Slice(slices) => node_matches(slices, id, payload),
        IrNode::Within {
            property,
            distance,
            lat,
            lon,
        } => geo_distance(payload, property, *lat, *lon).map_or(false, |d| d <= *distance),
    }
}

/// First radius query in the tree, used to report candidate distances.
fn first_within(node: &IrNode) -> Option<(&str, f64, f64)> {
    match node {
        IrNode::Within {
            property, lat, lon, ..
        } => Some((property.as_str(), *lat, *lon)),
        IrNode::And(l, r) | IrNode::Or(l, r) => first_within(l).or_else(|| first_within(r)),
        IrNode::Not { .. } | IrNode::Slice(_) => None,
    }
}

/// Sort key of one indexed document: the first value of each sort property.
fn sort_key(sort: &[SortPredicate], id: EntityId, payload: &Value) -> SortKey {
    sort.iter()
        .map(|term| property_values(id, payload, &term.property).into_iter().next())
        .collect()
}

/// Iterates `map` in `order`, starting strictly after `after`.
fn ordered_after<'a, V>(
    map: &'a BTreeMap<EntityId, V>,
    order: ScanOrder,
    after: Option<EntityId>,
) -> Box<dyn Iterator<Item = (&'a EntityId, &'a V)> + 'a> {
    use std::ops::Bound::{Excluded, Unbounded};
    match (order, after) {
        (ScanOrder::Ascending, Some(after)) => Box::new(map.range((Excluded(after), Unbounded))),
        (ScanOrder::Ascending, None) => Box::new(map.iter()),
        (ScanOrder::Descending, Some(after)) => {
            Box::new(map.range((Unbounded, Excluded(after))).rev())
        }
        (ScanOrder::Descending, None) => Box::new(map.iter().rev()),
    }
}

/// Authoritative entity store that also serves range and geo scans.
pub struct MemoryStore {
    records: RwLock<BTreeMap<EntityId, AuthoritativeRecord>>,
    shard_count: u32,
    unavailable: AtomicBool,
    load_calls: AtomicUsize,
    scan_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Store whose range indexes are split into `shard_count` shards.
    pub fn with_shards(shard_count: u32) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            shard_count: shard_count.max(1),
            unavailable: AtomicBool::new(false),
            load_calls: AtomicUsize::new(0),
            scan_calls: AtomicUsize::new(0),
        }
    }

    /// Writes a live record, replacing whatever is stored for `id`.
    pub fn insert(&self, id: EntityId, version: Version, payload: Value) {
        self.records.write().insert(
            id,
            AuthoritativeRecord {
                id,
                version,
                body: RecordBody::Payload(payload),
            },
        );
    }

    /// Replaces the record for `id` with a tombstone at `version`.
    pub fn tombstone(&self, id: EntityId, version: Version) {
        self.records.write().insert(
            id,
            AuthoritativeRecord {
                id,
                version,
                body: RecordBody::Tombstone,
            },
        );
    }

    /// Drops `id` entirely, as if it never replicated here.
    pub fn remove(&self, id: EntityId) {
        self.records.write().remove(&id);
    }

    /// Current record for `id`, tombstones included.
    pub fn get(&self, id: EntityId) -> Option<AuthoritativeRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Ids of every stored record, ascending.
    pub fn ids(&self) -> Vec<EntityId> {
        self.records.read().keys().copied().collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Makes every call fail with a retriable storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Number of `load_batch` round trips served.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(AtomicOrdering::SeqCst)
    }

    /// Number of range scan pages served.
    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(AtomicOrdering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(QuarryError::Storage("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn shard_of(&self, id: EntityId) -> ShardId {
        ShardId((id.0 % u64::from(self.shard_count)) as u32)
    }
}

#[async_trait]
impl RangeScanner for MemoryStore {
    async fn shards(&self, _property: &str) -> Result<Vec<ShardId>> {
        self.check_available()?;
        Ok((0..self.shard_count).map(ShardId).collect())
    }

    async fn scan(
        &self,
        shard: ShardId,
        slice: &QuerySlice,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        self.check_available()?;
        self.scan_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let order = if slice.reversed {
            ScanOrder::Descending
        } else {
            ScanOrder::Ascending
        };
        let records = self.records.read();
        let ids: Vec<EntityId> = ordered_after(&records, order, after)
            .filter(|(id, _)| self.shard_of(**id) == shard)
            .filter_map(|(id, record)| match &record.body {
                RecordBody::Payload(payload) if slice_matches(slice, *id, payload) => Some(*id),
                _ => None,
            })
            .take(limit)
            .collect();
        trace!(shard = shard.0, slice = %slice, returned = ids.len(), "memory range scan");
        Ok(ids)
    }
}

#[async_trait]
impl GeoIndex for MemoryStore {
    async fn within(
        &self,
        query: &GeoQuery,
        order: ScanOrder,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        self.check_available()?;
        let records = self.records.read();
        Ok(ordered_after(&records, order, after)
            .filter_map(|(id, record)| match &record.body {
                RecordBody::Payload(payload) => {
                    geo_distance(payload, &query.property, query.lat, query.lon)
                        .filter(|d| *d <= query.distance)
                        .map(|_| *id)
                }
                RecordBody::Tombstone => None,
            })
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn load_batch(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, AuthoritativeRecord>> {
        self.check_available()?;
        self.load_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let records = self.records.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|record| (*id, record.clone())))
            .collect())
    }
}

#[async_trait]
impl EntityWriter for MemoryStore {
    async fn write(&self, id: EntityId, version: Version, body: RecordBody) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write();
        if let Some(existing) = records.get(&id) {
            if existing.version > version {
                debug!(
                    id = id.0,
                    stored = existing.version.0,
                    incoming = version.0,
                    "ignoring older write"
                );
                return Ok(());
            }
        }
        records.insert(id, AuthoritativeRecord { id, version, body });
        Ok(())
    }
}

/// Secondary index holding one document per (id, indexed version).
#[derive(Default)]
pub struct MemorySearchIndex {
    scopes: RwLock<HashMap<SearchScope, BTreeMap<EntityId, BTreeMap<Version, Value>>>>,
    deindex_batches: Mutex<Vec<Vec<DeindexEntry>>>,
    unavailable: AtomicBool,
}

impl MemorySearchIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions currently indexed for `id`, oldest first.
    pub fn versions(&self, scope: &SearchScope, id: EntityId) -> Vec<Version> {
        self.scopes
            .read()
            .get(scope)
            .and_then(|docs| docs.get(&id))
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every de-index batch received so far.
    pub fn deindex_batches(&self) -> Vec<Vec<DeindexEntry>> {
        self.deindex_batches.lock().clone()
    }

    /// Makes every call fail with a retriable storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(QuarryError::Storage("search index marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn search(
        &self,
        scope: &SearchScope,
        query: &CandidateQuery<'_>,
    ) -> Result<Vec<Candidate>> {
        self.check_available()?;
        let scopes = self.scopes.read();
        let Some(docs) = scopes.get(scope) else {
            return Ok(Vec::new());
        };
        let geo = first_within(query.filter);
        let mut rows: Vec<Candidate> = docs
            .iter()
            .flat_map(|(id, versions)| {
                versions
                    .iter()
                    .map(move |(version, doc)| (*id, *version, doc))
            })
            .filter(|(id, _, doc)| matches_ir(query.filter, *id, doc))
            .map(|(id, version, doc)| Candidate {
                id,
                version,
                distance: geo
                    .and_then(|(property, lat, lon)| geo_distance(doc, property, lat, lon)),
                sort_key: sort_key(query.sort, id, doc),
            })
            .filter(|row| row.position().is_after(query.after, query.sort, query.order))
            .collect();
        rows.sort_by(|a, b| a.position().compare(&b.position(), query.sort, query.order));
        rows.truncate(query.limit);
        trace!(collection = %scope.collection, returned = rows.len(), "memory index search");
        Ok(rows)
    }

    async fn index(
        &self,
        scope: &SearchScope,
        id: EntityId,
        version: Version,
        payload: &Value,
    ) -> Result<()> {
        self.check_available()?;
        self.scopes
            .write()
            .entry(scope.clone())
            .or_default()
            .entry(id)
            .or_default()
            .insert(version, payload.clone());
        Ok(())
    }

    async fn deindex(&self, scope: &SearchScope, entries: &[DeindexEntry]) -> Result<()> {
        self.check_available()?;
        let mut scopes = self.scopes.write();
        if let Some(docs) = scopes.get_mut(scope) {
            for entry in entries {
                if let Some(versions) = docs.get_mut(&entry.id) {
                    versions.remove(&entry.version);
                    if versions.is_empty() {
                        docs.remove(&entry.id);
                    }
                }
            }
        }
        debug!(collection = %scope.collection, entries = entries.len(), "de-indexed batch");
        self.deindex_batches.lock().push(entries.to_vec());
        Ok(())
    }
}
