//! Lazy set-algebra execution of compiled plans.
//!
//! Every IR node becomes one [`IdStream`] producing ids in scan order. A
//! slice node is the intersection of its slices, each slice the union of its
//! shard scans. Streams pull from their children only when asked, so a page
//! never reads more than its ids plus one lookahead per branch.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::config::QueryConfig;
use crate::query::compiler::QueryPlan;
use crate::query::cursor::{Cursor, ScanOrder};
use crate::query::ir::IrNode;
use crate::query::slice::{QuerySlice, SliceNode};
use crate::query::sort::RowPosition;
use crate::storage::{GeoIndex, GeoQuery, RangeScanner};
use crate::types::{EntityId, QuarryError, Result, ShardId};

/// Pull-based ordered id stream.
#[async_trait]
pub trait IdStream: Send {
    /// Next id in scan order, `None` once exhausted.
    async fn try_next(&mut self) -> Result<Option<EntityId>>;
}

/// Boxed stream used to compose operators.
pub type BoxIdStream = Box<dyn IdStream>;

/// Stream over ids already in memory.
pub struct IdVecStream {
    ids: std::vec::IntoIter<EntityId>,
}

impl IdVecStream {
    /// Stream yielding `ids` as given.
    pub fn new(ids: Vec<EntityId>) -> Self {
        Self {
            ids: ids.into_iter(),
        }
    }

    /// Stream that yields nothing.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl IdStream for IdVecStream {
    async fn try_next(&mut self) -> Result<Option<EntityId>> {
        Ok(self.ids.next())
    }
}

/// Child stream with a one-element lookahead that is filled on demand.
struct Lookahead {
    inner: BoxIdStream,
    head: Option<EntityId>,
    primed: bool,
}

impl Lookahead {
    fn new(inner: BoxIdStream) -> Self {
        Self {
            inner,
            head: None,
            primed: false,
        }
    }

    async fn peek(&mut self) -> Result<Option<EntityId>> {
        if !self.primed {
            self.head = self.inner.try_next().await?;
            self.primed = true;
        }
        Ok(self.head)
    }

    fn consume(&mut self) {
        self.primed = false;
        self.head = None;
    }
}

/// Sorted merge-join of two streams.
pub struct IntersectionStream {
    left: Lookahead,
    right: Lookahead,
    order: ScanOrder,
}

impl IntersectionStream {
    /// Ids produced by both inputs, which must share `order`.
    pub fn new(left: BoxIdStream, right: BoxIdStream, order: ScanOrder) -> Self {
        Self {
            left: Lookahead::new(left),
            right: Lookahead::new(right),
            order,
        }
    }
}

#[async_trait]
impl IdStream for IntersectionStream {
    async fn try_next(&mut self) -> Result<Option<EntityId>> {
        loop {
            let Some(l) = self.left.peek().await? else {
                return Ok(None);
            };
            let Some(r) = self.right.peek().await? else {
                return Ok(None);
            };
            match self.order.cmp(l, r) {
                Ordering::Equal => {
                    self.left.consume();
                    self.right.consume();
                    return Ok(Some(l));
                }
                Ordering::Less => self.left.consume(),
                Ordering::Greater => self.right.consume(),
            }
        }
    }
}

/// De-duplicating ordered merge of two streams.
pub struct UnionStream {
    left: Lookahead,
    right: Lookahead,
    order: ScanOrder,
}

impl UnionStream {
    /// Ids produced by either input, each once.
    pub fn new(left: BoxIdStream, right: BoxIdStream, order: ScanOrder) -> Self {
        Self {
            left: Lookahead::new(left),
            right: Lookahead::new(right),
            order,
        }
    }
}

#[async_trait]
impl IdStream for UnionStream {
    async fn try_next(&mut self) -> Result<Option<EntityId>> {
        let l = self.left.peek().await?;
        let r = self.right.peek().await?;
        let next = match (l, r) {
            (None, None) => None,
            (Some(l), None) => {
                self.left.consume();
                Some(l)
            }
            (None, Some(r)) => {
                self.right.consume();
                Some(r)
            }
            (Some(l), Some(r)) => match self.order.cmp(l, r) {
                Ordering::Less => {
                    self.left.consume();
                    Some(l)
                }
                Ordering::Greater => {
                    self.right.consume();
                    Some(r)
                }
                Ordering::Equal => {
                    self.left.consume();
                    self.right.consume();
                    Some(l)
                }
            },
        };
        Ok(next)
    }
}

/// Ids of `keep` that `remove` does not produce.
pub struct SubtractionStream {
    keep: Lookahead,
    remove: Lookahead,
    order: ScanOrder,
}

impl SubtractionStream {
    /// Ids of `keep` that `remove` never produces.
    pub fn new(keep: BoxIdStream, remove: BoxIdStream, order: ScanOrder) -> Self {
        Self {
            keep: Lookahead::new(keep),
            remove: Lookahead::new(remove),
            order,
        }
    }
}

#[async_trait]
impl IdStream for SubtractionStream {
    async fn try_next(&mut self) -> Result<Option<EntityId>> {
        loop {
            let Some(k) = self.keep.peek().await? else {
                return Ok(None);
            };
            let Some(r) = self.remove.peek().await? else {
                self.keep.consume();
                return Ok(Some(k));
            };
            match self.order.cmp(k, r) {
                Ordering::Less => {
                    self.keep.consume();
                    return Ok(Some(k));
                }
                Ordering::Equal => {
                    self.keep.consume();
                    self.remove.consume();
                }
                Ordering::Greater => self.remove.consume(),
            }
        }
    }
}

enum ScanSource {
    Range {
        scanner: Arc<dyn RangeScanner>,
        shard: ShardId,
        slice: QuerySlice,
    },
    Geo {
        index: Arc<dyn GeoIndex>,
        query: GeoQuery,
        order: ScanOrder,
    },
}

/// Leaf stream paging ids from storage.
struct LeafScanStream {
    source: ScanSource,
    after: Option<EntityId>,
    page_size: usize,
    buffer: VecDeque<EntityId>,
    exhausted: bool,
}

impl LeafScanStream {
    fn new(source: ScanSource, after: Option<EntityId>, page_size: usize) -> Self {
        Self {
            source,
            after,
            page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    async fn fetch(&mut self) -> Result<()> {
        let page = match &self.source {
            ScanSource::Range {
                scanner,
                shard,
                slice,
            } => scanner.scan(*shard, slice, self.after, self.page_size).await?,
            ScanSource::Geo {
                index,
                query,
                order,
            } => index.within(query, *order, self.after, self.page_size).await?,
        };
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(*last);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

#[async_trait]
impl IdStream for LeafScanStream {
    async fn try_next(&mut self) -> Result<Option<EntityId>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch().await?;
        }
        Ok(self.buffer.pop_front())
    }
}

/// Requested page of a plan's results.
#[derive(Clone, Debug, Default)]
pub struct PageRequest {
    /// Page size; the configured default when `None`.
    pub limit: Option<usize>,
    /// Token returned by the previous page.
    pub cursor: Option<String>,
    /// Scan order; must match the cursor's when resuming.
    pub order: ScanOrder,
}

impl PageRequest {
    /// First page of `limit` ids in ascending order.
    pub fn first(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Page following `cursor`.
    pub fn resume(limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            limit: Some(limit),
            cursor: Some(cursor.into()),
            order: ScanOrder::Ascending,
        }
    }

    /// Switches the request to descending order.
    pub fn descending(mut self) -> Self {
        self.order = ScanOrder::Descending;
        self
    }

    /// Validates the request against `plan_hash` and the limits in `config`.
    pub fn resolve(&self, plan_hash: u64, config: &QueryConfig) -> Result<ResolvedPage> {
        let limit = self.limit.unwrap_or(config.default_limit).min(config.max_limit);
        if limit == 0 {
            return Err(QuarryError::Invalid("page limit must be positive"));
        }
        let (after, row) = match &self.cursor {
            Some(token) => {
                let cursor = Cursor::decode_for(token, plan_hash)?;
                if cursor.order != self.order {
                    return Err(QuarryError::InvalidCursor(format!(
                        "issued for {:?} order, requested {:?}",
                        cursor.order, self.order
                    )));
                }
                (Some(cursor.after), cursor.row)
            }
            None => (None, None),
        };
        Ok(ResolvedPage {
            limit,
            order: self.order,
            after,
            row,
            plan_hash,
        })
    }
}

/// Page parameters after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPage {
    /// Page size after clamping to the configured maximum.
    pub limit: usize,
    /// Scan order.
    pub order: ScanOrder,
    /// Last id of the previous page.
    pub after: Option<EntityId>,
    /// Last index row of the previous search page, when it was a search.
    pub row: Option<RowPosition>,
    /// Plan the page belongs to.
    pub plan_hash: u64,
}

impl ResolvedPage {
    /// Token resuming after `last`.
    pub fn cursor_after(&self, last: EntityId) -> Result<String> {
        Cursor {
            plan_hash: self.plan_hash,
            order: self.order,
            after: last,
            row: None,
        }
        .encode()
    }

    /// Token resuming a search after the index row at `row`.
    pub fn cursor_at(&self, row: RowPosition) -> Result<String> {
        Cursor {
            plan_hash: self.plan_hash,
            order: self.order,
            after: row.id,
            row: Some(row),
        }
        .encode()
    }

    /// Where a search resumes: the recorded row, else past every row of
    /// the last id.
    pub fn resume_row(&self) -> Option<RowPosition> {
        self.row
            .clone()
            .or_else(|| self.after.map(|id| RowPosition::past_id(id, self.order)))
    }
}

/// One page of ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Ids in scan order.
    pub ids: Vec<EntityId>,
    /// Present when more ids follow.
    pub cursor: Option<String>,
}

/// Builds and drains id streams over a range scanner and optional geo index.
pub struct Executor {
    scanner: Arc<dyn RangeScanner>,
    geo: Option<Arc<dyn GeoIndex>>,
    config: QueryConfig,
}

impl Executor {
    /// Executor over `scanner`; `within` predicates need [`Executor::with_geo`].
    pub fn new(scanner: Arc<dyn RangeScanner>, config: QueryConfig) -> Self {
        Self {
            scanner,
            geo: None,
            config,
        }
    }

    /// Enables `within` predicates.
    pub fn with_geo(mut self, geo: Arc<dyn GeoIndex>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Paging limits in effect.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Opens the stream for `root`, starting strictly after `after`.
    pub async fn open(
        &self,
        root: &IrNode,
        order: ScanOrder,
        after: Option<EntityId>,
    ) -> Result<BoxIdStream> {
        self.build(root, order, after).await
    }

    /// Pulls one page of `plan`'s results.
    pub async fn page(&self, plan: &QueryPlan, request: &PageRequest) -> Result<Page> {
        if !plan.sort.is_empty() {
            return Err(QuarryError::Unsupported(
                "order by is served by a search index, not by range scans",
            ));
        }
        let resolved = request.resolve(plan.plan_hash, &self.config)?;
        let mut stream = self.open(&plan.root, resolved.order, resolved.after).await?;
        let mut ids = Vec::with_capacity(resolved.limit);
        while ids.len() < resolved.limit {
            match stream.try_next().await? {
                Some(id) => ids.push(id),
                None => break,
            }
        }
        let has_more = ids.len() == resolved.limit && stream.try_next().await?.is_some();
        let cursor = match (has_more, ids.last()) {
            (true, Some(last)) => Some(resolved.cursor_after(*last)?),
            _ => None,
        };
        debug!(
            plan_hash = plan.plan_hash,
            returned = ids.len(),
            has_more,
            "executed page"
        );
        Ok(Page { ids, cursor })
    }

    fn build<'a>(
        &'a self,
        node: &'a IrNode,
        order: ScanOrder,
        after: Option<EntityId>,
    ) -> BoxFuture<'a, Result<BoxIdStream>> {
        async move {
            let stream: BoxIdStream = match node {
                IrNode::Slice(slices) => self.slice_node(slices, order, after).await?,
                IrNode::Or(l, r) => Box::new(UnionStream::new(
                    self.build(l, order, after).await?,
                    self.build(r, order, after).await?,
                    order,
                )),
                IrNode::And(l, r) => match (l.as_ref(), r.as_ref()) {
                    (other, IrNode::Not { subtract, .. })
                    | (IrNode::Not { subtract, .. }, other) => {
                        Box::new(SubtractionStream::new(
                            self.build(other, order, after).await?,
                            self.build(subtract, order, after).await?,
                            order,
                        ))
                    }
                    _ => Box::new(IntersectionStream::new(
                        self.build(l, order, after).await?,
                        self.build(r, order, after).await?,
                        order,
                    )),
                },
                IrNode::Not { subtract, keep } => Box::new(SubtractionStream::new(
                    self.slice_node(keep, order, after).await?,
                    self.build(subtract, order, after).await?,
                    order,
                )),
                IrNode::Within {
                    property,
                    distance,
                    lat,
                    lon,
                } => {
                    let index = self
                        .geo
                        .clone()
                        .ok_or(QuarryError::Unsupported("no geo index configured"))?;
                    let query = GeoQuery {
                        property: property.clone(),
                        distance: *distance,
                        lat: *lat,
                        lon: *lon,
                    };
                    Box::new(LeafScanStream::new(
                        ScanSource::Geo {
                            index,
                            query,
                            order,
                        },
                        after,
                        self.config.scan_page_size,
                    ))
                }
            };
            Ok(stream)
        }
        .boxed()
    }

    async fn slice_node(
        &self,
        node: &SliceNode,
        order: ScanOrder,
        after: Option<EntityId>,
    ) -> Result<BoxIdStream> {
        let mut combined: Option<BoxIdStream> = None;
        for slice in node.slices() {
            let stream = self.slice(slice, order, after).await?;
            combined = Some(match combined {
                None => stream,
                Some(prev) => Box::new(IntersectionStream::new(prev, stream, order)),
            });
        }
        Ok(combined.unwrap_or_else(|| Box::new(IdVecStream::empty())))
    }

    async fn slice(
        &self,
        slice: &QuerySlice,
        order: ScanOrder,
        after: Option<EntityId>,
    ) -> Result<BoxIdStream> {
        if slice.is_empty_range() {
            return Ok(Box::new(IdVecStream::empty()));
        }
        let mut scan = slice.clone();
        scan.reversed = order.is_descending();
        let mut combined: Option<BoxIdStream> = None;
        for shard in self.scanner.shards(&slice.property).await? {
            let stream: BoxIdStream = Box::new(LeafScanStream::new(
                ScanSource::Range {
                    scanner: Arc::clone(&self.scanner),
                    shard,
                    slice: scan.clone(),
                },
                after,
                self.config.scan_page_size,
            ));
            combined = Some(match combined {
                None => stream,
                Some(prev) => Box::new(UnionStream::new(prev, stream, order)),
            });
        }
        Ok(combined.unwrap_or_else(|| Box::new(IdVecStream::empty())))
    }
}

/// Drains a stream into a vector.
pub async fn collect_ids(stream: &mut BoxIdStream) -> Result<Vec<EntityId>> {
    let mut out = Vec::new();
    while let Some(id) = stream.try_next().await? {
        out.push(id);
    }
    Ok(out)
}
