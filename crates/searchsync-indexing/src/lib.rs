//! Search index updater for searchsync.
//!
//! This crate turns change notifications into a consistent, policy-filtered
//! search index.
//!
//! ## Key Components
//!
//! - [`ChangeQueue`]: Per-thing coalescing queue with an ack and a default lane
//! - [`EnforcerCache`]: Shared-future cache of policy enforcers
//! - [`EnforcementStage`]: Retrieves things and builds write models, failing closed
//! - [`BulkWriteStage`]: Batches write models into guarded bulk writes
//! - [`interpret`]: Classifies bulk write outcomes and resolves acknowledgements
//! - [`BackgroundSync`]: Compares the authoritative store with the index and emits repairs
//! - [`UpdaterPipeline`]: Wires the stages together, one worker per queue lane
//! - [`InMemoryIndex`]: Reference bulk write sink and index metadata source
//!
//! ## Flow
//!
//! 1. Changes are enqueued and merged per thing
//! 2. A lane worker drains its lane
//! 3. Enforcement retrieves each thing and resolves its enforcer
//! 4. Write models are written in bounded bulk writes
//! 5. Every change is acknowledged, negatively acknowledged, or retried in full
//!
//! ## Example
//!
//! ```ignore
//! use searchsync_indexing::{MapperRegistry, UpdaterPipeline};
//!
//! let pipeline = UpdaterPipeline::from_settings(
//!     &settings, retriever, loader, sink, &MapperRegistry::with_defaults(),
//! )?;
//! let running = pipeline.spawn(cancel.child_token());
//! running.queue().enqueue(change).await?;
//! ```

pub mod background_sync;
pub mod bulk_write;
pub mod cache;
pub mod enforcement;
pub mod error;
pub mod mapper;
pub mod memory_index;
pub mod pipeline;
pub mod queue;
pub mod result;

pub use background_sync::{
    merge_by_id, throttle, BackgroundSync, BackgroundSyncConfig, MetadataPair, MetadataSource,
    MetadataStream, PolicyRevisions, RepairStream,
};
pub use bulk_write::{
    BulkWriteConfig, BulkWriteFailure, BulkWriteOutcome, BulkWriteResult, BulkWriteSink,
    BulkWriteStage, IndexedWriteError, WriteConcern, WriteOp, DUPLICATE_KEY_CODE,
};
pub use cache::{EnforcerCache, EnforcerCacheConfig, EnforcerLoader};
pub use enforcement::{incremental_base, EnforcementConfig, EnforcementStage, ThingRetriever};
pub use error::{IndexingError, ProviderError};
pub use mapper::{DefaultMapper, MapperRegistry, SearchUpdateMapper, DEFAULT_MAPPER};
pub use memory_index::InMemoryIndex;
pub use pipeline::{
    PipelineConfig, PipelineStats, PipelineStatsSnapshot, ProcessResult, RunningPipeline,
    UpdaterPipeline,
};
pub use queue::{
    ChangeBatch, ChangeQueue, ChangeQueueConfig, ChangeQueueHandle, Lane, QueueLengths,
};
pub use result::{classify, interpret, BulkWriteStatus, ResultReport};
