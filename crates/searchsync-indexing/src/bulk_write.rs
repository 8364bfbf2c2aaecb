//! Bulk write stage.
//!
//! Groups write models into bounded batches and executes one unordered bulk
//! write per batch against a [`BulkWriteSink`]. The stage never interprets the
//! result; it only captures it in a [`BulkWriteOutcome`] together with the
//! models it belongs to.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use searchsync_types::{
    LatencySegment, SearchDocument, SyncMetadata, ThingId, UpdaterSettings, WriteModel,
};

/// Error code the sink reports for an upsert that lost against a newer document.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Durability requested from the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Acknowledged by the primary
    Default,
    /// Acknowledged once journaled, used when an originator waits for the ack
    Journaled,
}

/// One guarded operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the indexed document if [`WriteOp::upsert_applies`], insert it if
    /// missing. Losing against an existing document is a duplicate-key error.
    Upsert { document: SearchDocument },
    /// Replace the indexed document only if its revision equals `expected_revision`.
    /// Never inserts.
    PatchReplace {
        expected_revision: i64,
        document: SearchDocument,
    },
    /// Remove the indexed document if its revision is at most `revision`.
    Delete { thing_id: ThingId, revision: i64 },
}

impl WriteOp {
    pub fn from_model(model: &WriteModel) -> Self {
        match model {
            WriteModel::Update { document, .. } => WriteOp::Upsert {
                document: document.clone(),
            },
            WriteModel::Patch {
                expected_revision,
                document,
                ..
            } => WriteOp::PatchReplace {
                expected_revision: *expected_revision,
                document: document.clone(),
            },
            WriteModel::Delete { metadata } => WriteOp::Delete {
                thing_id: metadata.thing_id.clone(),
                revision: metadata.thing_revision,
            },
        }
    }

    pub fn thing_id(&self) -> &ThingId {
        match self {
            WriteOp::Upsert { document } | WriteOp::PatchReplace { document, .. } => {
                &document.thing_id
            }
            WriteOp::Delete { thing_id, .. } => thing_id,
        }
    }

    /// Upsert guard: a document replaces the indexed one if it is of a newer
    /// thing revision, or of the same revision under a different policy state.
    pub fn upsert_applies(indexed: &SyncMetadata, document: &SearchDocument) -> bool {
        indexed.thing_revision < document.thing_revision
            || (indexed.thing_revision == document.thing_revision
                && (indexed.policy_id != document.policy_id
                    || indexed.policy_revision != document.policy_revision))
    }
}

/// Counts reported by the sink for one bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub acknowledged: bool,
    pub matched: usize,
    pub modified: usize,
    pub inserted: usize,
    pub upserted: usize,
    pub deleted: usize,
}

impl BulkWriteResult {
    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            ..Self::default()
        }
    }
}

/// Failure of one operation inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedWriteError {
    /// Position of the failed operation in the request
    pub index: usize,
    pub code: i32,
    pub message: String,
}

impl IndexedWriteError {
    pub fn new(index: usize, code: i32, message: impl Into<String>) -> Self {
        Self {
            index,
            code,
            message: message.into(),
        }
    }

    pub fn duplicate_key(index: usize) -> Self {
        Self::new(index, DUPLICATE_KEY_CODE, "duplicate key")
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == DUPLICATE_KEY_CODE
    }
}

/// Bulk write that did not fully succeed.
#[derive(Debug, Clone, Error)]
pub enum BulkWriteFailure {
    /// Some operations failed; the others were applied
    #[error("bulk write partially failed with {} errors", .errors.len())]
    Partial {
        result: BulkWriteResult,
        errors: Vec<IndexedWriteError>,
    },
    /// Nothing is known about what was applied
    #[error("bulk write failed: {0}")]
    Other(String),
}

/// Persistence sink of the search index.
#[async_trait]
pub trait BulkWriteSink: Send + Sync {
    async fn bulk_write(
        &self,
        ops: Vec<WriteOp>,
        concern: WriteConcern,
    ) -> Result<BulkWriteResult, BulkWriteFailure>;
}

/// Everything known about one executed batch.
#[derive(Debug)]
pub struct BulkWriteOutcome {
    /// Models of the batch, in request order
    pub models: Vec<WriteModel>,
    /// Result reported by the sink, if any
    pub result: Option<BulkWriteResult>,
    pub errors: Vec<IndexedWriteError>,
    /// Failure that left nothing provably durable
    pub unexpected: Option<String>,
}

impl BulkWriteOutcome {
    pub fn batch_size(&self) -> usize {
        self.models.len()
    }
}

/// Configuration for the bulk write stage.
#[derive(Debug, Clone)]
pub struct BulkWriteConfig {
    pub max_bulk_size: usize,
    /// Batches written concurrently
    pub write_parallelism: usize,
}

impl Default for BulkWriteConfig {
    fn default() -> Self {
        Self::from_settings(&UpdaterSettings::default())
    }
}

impl BulkWriteConfig {
    pub fn from_settings(settings: &UpdaterSettings) -> Self {
        Self {
            max_bulk_size: settings.max_bulk_size.max(1),
            write_parallelism: settings.write_parallelism.max(1),
        }
    }

    pub fn with_max_bulk_size(mut self, size: usize) -> Self {
        self.max_bulk_size = size.max(1);
        self
    }

    pub fn with_write_parallelism(mut self, parallelism: usize) -> Self {
        self.write_parallelism = parallelism.max(1);
        self
    }
}

/// Executes write models against the sink.
pub struct BulkWriteStage {
    sink: Arc<dyn BulkWriteSink>,
    config: BulkWriteConfig,
}

impl BulkWriteStage {
    pub fn new(sink: Arc<dyn BulkWriteSink>, config: BulkWriteConfig) -> Self {
        Self { sink, config }
    }

    /// Split models into batches of at most `max_bulk_size`.
    pub fn chunk(&self, models: Vec<WriteModel>) -> Vec<Vec<WriteModel>> {
        let mut batches = Vec::with_capacity(models.len().div_ceil(self.config.max_bulk_size));
        let mut current = Vec::with_capacity(self.config.max_bulk_size.min(models.len()));
        for model in models {
            current.push(model);
            if current.len() == self.config.max_bulk_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Write all models, yielding one outcome per batch.
    pub fn write_all(&self, models: Vec<WriteModel>) -> BoxStream<'_, BulkWriteOutcome> {
        stream::iter(self.chunk(models))
            .map(move |batch| self.write_batch(batch))
            .buffered(self.config.write_parallelism)
            .boxed()
    }

    /// Execute one bulk write.
    pub async fn write_batch(&self, mut models: Vec<WriteModel>) -> BulkWriteOutcome {
        let mut concern = WriteConcern::Default;
        for model in &mut models {
            model.metadata_mut().start_segment(LatencySegment::BulkWrite);
            if model.metadata().requires_ack() {
                concern = WriteConcern::Journaled;
            }
        }
        let ops: Vec<WriteOp> = models.iter().map(WriteOp::from_model).collect();

        debug!(size = ops.len(), concern = ?concern, "Executing bulk write");
        match self.sink.bulk_write(ops, concern).await {
            Ok(result) => BulkWriteOutcome {
                models,
                result: Some(result),
                errors: Vec::new(),
                unexpected: None,
            },
            Err(BulkWriteFailure::Partial { result, errors }) => {
                debug!(size = models.len(), errors = errors.len(), "Bulk write partially failed");
                BulkWriteOutcome {
                    models,
                    result: Some(result),
                    errors,
                    unexpected: None,
                }
            }
            Err(BulkWriteFailure::Other(message)) => {
                warn!(size = models.len(), error = %message, "Bulk write failed");
                BulkWriteOutcome {
                    models,
                    result: None,
                    errors: Vec::new(),
                    unexpected: Some(message),
                }
            }
        }
    }
}
