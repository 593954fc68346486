//! Staged entity writes.
//!
//! A [`WritePipeline`] is an ordered list of [`WriteStage`]s run over one
//! [`WriteContext`]. The payload changes shape as it moves through the
//! stages, and each stage checks it received the shape it consumes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::storage::{EntityWriter, RecordBody, SearchIndex, SearchScope};
use crate::types::{EntityId, QuarryError, Result, Version};

/// Entity as submitted, before it has a version.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEntity {
    /// Entity id.
    pub id: EntityId,
    /// Fields or deletion marker to write.
    pub body: RecordBody,
}

/// Entity with an assigned version.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedEntity {
    /// Entity id.
    pub id: EntityId,
    /// Version assigned by the clock.
    pub version: Version,
    /// Fields or deletion marker to write.
    pub body: RecordBody,
}

/// Payload carried between stages.
#[derive(Clone, Debug, PartialEq)]
pub enum StagePayload {
    /// Not yet versioned.
    Raw(RawEntity),
    /// Versioned, not yet written.
    Versioned(VersionedEntity),
    /// Written to the primary store.
    Committed(VersionedEntity),
}

impl StagePayload {
    /// Short name of the variant, for errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StagePayload::Raw(_) => "raw",
            StagePayload::Versioned(_) => "versioned",
            StagePayload::Committed(_) => "committed",
        }
    }
}

/// State passed by reference through every stage.
#[derive(Clone, Debug)]
pub struct WriteContext {
    /// Collection the entity is written to.
    pub scope: SearchScope,
    /// Entity in its current stage.
    pub payload: StagePayload,
}

fn mismatch(stage: &'static str, expected: &'static str, payload: &StagePayload) -> QuarryError {
    QuarryError::Pipeline {
        stage,
        expected,
        found: payload.kind(),
    }
}

/// One step of a write.
#[async_trait]
pub trait WriteStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reads the payload from `ctx` and replaces it with this stage's output.
    async fn apply(&self, ctx: &mut WriteContext) -> Result<()>;
}

/// Time-ordered, strictly increasing version source.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    /// Clock that has issued no version yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version: wall-clock microseconds, bumped past the previous
    /// version when the clock stalls or steps back.
    pub fn next(&self) -> Version {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Version(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Raw → Versioned.
pub struct AssignVersion {
    clock: Arc<VersionClock>,
}

impl AssignVersion {
    /// Stage drawing versions from `clock`.
    pub fn new(clock: Arc<VersionClock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl WriteStage for AssignVersion {
    fn name(&self) -> &'static str {
        "assign_version"
    }

    async fn apply(&self, ctx: &mut WriteContext) -> Result<()> {
        let StagePayload::Raw(raw) = &ctx.payload else {
            return Err(mismatch(self.name(), "raw", &ctx.payload));
        };
        let versioned = VersionedEntity {
            id: raw.id,
            version: self.clock.next(),
            body: raw.body.clone(),
        };
        ctx.payload = StagePayload::Versioned(versioned);
        Ok(())
    }
}

/// Versioned → Committed, writing the primary store.
pub struct CommitEntity {
    writer: Arc<dyn EntityWriter>,
}

impl CommitEntity {
    /// Stage writing through `writer`.
    pub fn new(writer: Arc<dyn EntityWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl WriteStage for CommitEntity {
    fn name(&self) -> &'static str {
        "commit_entity"
    }

    async fn apply(&self, ctx: &mut WriteContext) -> Result<()> {
        let StagePayload::Versioned(entity) = &ctx.payload else {
            return Err(mismatch(self.name(), "versioned", &ctx.payload));
        };
        self.writer
            .write(entity.id, entity.version, entity.body.clone())
            .await?;
        ctx.payload = StagePayload::Committed(entity.clone());
        Ok(())
    }
}

/// Committed → Committed, writing the search index for live entities.
pub struct IndexEntity {
    index: Arc<dyn SearchIndex>,
}

impl IndexEntity {
    /// Stage indexing into `index`.
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl WriteStage for IndexEntity {
    fn name(&self) -> &'static str {
        "index_entity"
    }

    async fn apply(&self, ctx: &mut WriteContext) -> Result<()> {
        let StagePayload::Committed(entity) = &ctx.payload else {
            return Err(mismatch(self.name(), "committed", &ctx.payload));
        };
        if let RecordBody::Payload(payload) = &entity.body {
            self.index
                .index(&ctx.scope, entity.id, entity.version, payload)
                .await?;
        }
        Ok(())
    }
}

/// Ordered stage list.
#[derive(Default)]
pub struct WritePipeline {
    stages: Vec<Box<dyn WriteStage>>,
}

impl WritePipeline {
    /// Pipeline with no stages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `stage`; stages run in the order added.
    pub fn with_stage(mut self, stage: impl WriteStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Version, commit and index stages in that order.
    pub fn standard(
        clock: Arc<VersionClock>,
        writer: Arc<dyn EntityWriter>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self::new()
            .with_stage(AssignVersion::new(clock))
            .with_stage(CommitEntity::new(writer))
            .with_stage(IndexEntity::new(index))
    }

    /// Stage names in run order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage over a fresh context holding `payload`.
    pub async fn run(&self, scope: SearchScope, payload: StagePayload) -> Result<WriteContext> {
        let mut ctx = WriteContext { scope, payload };
        for stage in &self.stages {
            trace!(stage = stage.name(), payload = ctx.payload.kind(), "running write stage");
            stage.apply(&mut ctx).await?;
        }
        debug!(
            collection = %ctx.scope.collection,
            payload = ctx.payload.kind(),
            "write pipeline finished"
        );
        Ok(ctx)
    }

    /// Runs the pipeline for a raw entity.
    pub async fn write(
        &self,
        scope: SearchScope,
        id: EntityId,
        body: RecordBody,
    ) -> Result<WriteContext> {
        self.run(scope, StagePayload::Raw(RawEntity { id, body })).await
    }
}
