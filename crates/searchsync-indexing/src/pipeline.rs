//! Updater pipeline.
//!
//! Wires the change queue, enforcement, bulk write and result interpretation
//! together. One worker per queue lane drains its lane, turns the batch into
//! write models, writes them and resolves every callback. Patch models that hit
//! an unexpected base revision go back into the queue as full retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use searchsync_types::Settings;

use crate::bulk_write::{BulkWriteConfig, BulkWriteSink, BulkWriteStage};
use crate::cache::{EnforcerCache, EnforcerCacheConfig, EnforcerLoader};
use crate::enforcement::{EnforcementConfig, EnforcementStage, ThingRetriever};
use crate::error::IndexingError;
use crate::mapper::MapperRegistry;
use crate::queue::{ChangeBatch, ChangeQueue, ChangeQueueConfig, ChangeQueueHandle, Lane};
use crate::result::{interpret, BulkWriteStatus};

/// Result of processing one drained batch.
#[derive(Debug, Default)]
pub struct ProcessResult {
    /// Changes in the drained batch
    pub changes: usize,
    /// Bulk writes executed
    pub bulk_writes: usize,
    pub acked: usize,
    pub nacked: usize,
    /// Changes re-enqueued for a full retry
    pub retried: usize,
    /// Classification of every bulk write, in write order
    pub statuses: Vec<BulkWriteStatus>,
}

impl ProcessResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything was written.
    pub fn has_updates(&self) -> bool {
        self.bulk_writes > 0
    }
}

/// Counters across all batches of a running pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches: AtomicU64,
    changes: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub batches: u64,
    pub changes: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retried: u64,
}

impl PipelineStats {
    fn record(&self, result: &ProcessResult) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.changes.fetch_add(result.changes as u64, Ordering::Relaxed);
        self.acked.fetch_add(result.acked as u64, Ordering::Relaxed);
        self.nacked.fetch_add(result.nacked as u64, Ordering::Relaxed);
        self.retried.fetch_add(result.retried as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Configuration for the updater pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Interval between drains of one lane; zero drains as soon as the lane has changes
    pub drain_interval: Duration,
    pub queue: ChangeQueueConfig,
    pub enforcement: EnforcementConfig,
    pub bulk_write: BulkWriteConfig,
    pub cache: EnforcerCacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            drain_interval: settings.updater.drain_interval(),
            queue: ChangeQueueConfig::from_settings(&settings.updater),
            enforcement: EnforcementConfig::from_settings(&settings.updater),
            bulk_write: BulkWriteConfig::from_settings(&settings.updater),
            cache: EnforcerCacheConfig::from_settings(&settings.cache),
        }
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

/// Enforcement, bulk write and interpretation of drained batches.
pub struct UpdaterPipeline {
    enforcement: EnforcementStage,
    bulk_write: BulkWriteStage,
    cache: Arc<EnforcerCache>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
}

impl UpdaterPipeline {
    pub fn new(
        enforcement: EnforcementStage,
        bulk_write: BulkWriteStage,
        cache: Arc<EnforcerCache>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            enforcement,
            bulk_write,
            cache,
            config,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Build the pipeline from settings, resolving the configured mapper.
    pub fn from_settings(
        settings: &Settings,
        retriever: Arc<dyn ThingRetriever>,
        loader: Arc<dyn EnforcerLoader>,
        sink: Arc<dyn BulkWriteSink>,
        mappers: &MapperRegistry,
    ) -> Result<Self, IndexingError> {
        let config = PipelineConfig::from_settings(settings);
        let mapper = mappers.resolve(&settings.updater.mapper)?;
        let cache = Arc::new(EnforcerCache::new(loader, config.cache.clone()));
        let enforcement =
            EnforcementStage::new(retriever, cache.clone(), mapper, config.enforcement.clone());
        let bulk_write = BulkWriteStage::new(sink, config.bulk_write.clone());
        Ok(Self::new(enforcement, bulk_write, cache, config))
    }

    /// Enforcer cache shared with background sync.
    pub fn cache(&self) -> Arc<EnforcerCache> {
        self.cache.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Process one drained batch end to end.
    ///
    /// Every change of the batch is either acknowledged, negatively
    /// acknowledged, or handed back to `queue` for a full retry.
    pub async fn process_batch(&self, batch: ChangeBatch, queue: &ChangeQueueHandle) -> ProcessResult {
        let mut result = ProcessResult::new();
        if batch.is_empty() {
            return result;
        }
        result.changes = batch.len();

        let models = self.enforcement.process_batch(batch).await;
        let mut outcomes = self.bulk_write.write_all(models);
        while let Some(outcome) = outcomes.next().await {
            let report = interpret(outcome);
            result.bulk_writes += 1;
            result.acked += report.acked;
            result.nacked += report.nacked;
            result.statuses.push(report.status);

            for retry in report.retries {
                let thing_id = retry.thing_id.clone();
                match queue.enqueue(retry).await {
                    Ok(()) => result.retried += 1,
                    Err(e) => {
                        warn!(thing_id = %thing_id, error = %e, "Could not re-enqueue retry");
                        result.nacked += 1;
                    }
                }
            }
        }

        self.stats.record(&result);
        result
    }

    /// Start the change queue and one worker per lane.
    pub fn spawn(self, cancel: CancellationToken) -> RunningPipeline {
        let (queue, queue_task) =
            ChangeQueue::new(self.config.queue.clone()).spawn(cancel.child_token());
        let stats = self.stats.clone();
        let cache = self.cache.clone();
        let pipeline = Arc::new(self);

        let mut tasks = vec![queue_task];
        for lane in Lane::ALL {
            tasks.push(tokio::spawn(pipeline.clone().run_lane(
                lane,
                queue.clone(),
                cancel.clone(),
            )));
        }
        info!(lanes = Lane::ALL.len(), "Updater pipeline started");

        RunningPipeline {
            queue,
            cache,
            stats,
            cancel,
            tasks,
        }
    }

    async fn run_lane(self: Arc<Self>, lane: Lane, queue: ChangeQueueHandle, cancel: CancellationToken) {
        let mut ticker = (!self.config.drain_interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(self.config.drain_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = queue.drain(lane) => match batch {
                    Ok(batch) => batch,
                    Err(_) => break,
                },
            };

            let result = self.process_batch(batch, &queue).await;
            debug!(
                lane = %lane,
                changes = result.changes,
                acked = result.acked,
                nacked = result.nacked,
                retried = result.retried,
                "Processed batch"
            );
        }
        info!(lane = %lane, "Lane worker stopped");
    }
}

/// Handle to a spawned pipeline.
pub struct RunningPipeline {
    queue: ChangeQueueHandle,
    cache: Arc<EnforcerCache>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Handle to enqueue changes.
    pub fn queue(&self) -> ChangeQueueHandle {
        self.queue.clone()
    }

    pub fn cache(&self) -> Arc<EnforcerCache> {
        self.cache.clone()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop all workers. Changes still queued are negatively acknowledged.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline task failed");
            }
        }
        info!("Updater pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::MapLoader;
    use crate::enforcement::tests::MapRetriever;
    use crate::memory_index::InMemoryIndex;
    use searchsync_types::{
        AckRecipient, ChangeMetadata, PolicyEnforcer, SearchDocument, ThingEvent, ThingEventKind,
        ThingId,
    };
    use serde_json::json;
    use std::collections::BTreeSet;

    struct Fixture {
        retriever: Arc<MapRetriever>,
        index: Arc<InMemoryIndex>,
        pipeline: UpdaterPipeline,
    }

    fn fixture(drain_interval: Duration) -> Fixture {
        let retriever = Arc::new(MapRetriever::default());
        let loader = Arc::new(MapLoader::with(vec![PolicyEnforcer::new("p", 1).grant("u", "/")]));
        let index = Arc::new(InMemoryIndex::new());

        let mut settings = Settings::default();
        settings.updater.drain_interval_ms = drain_interval.as_millis() as u64;
        settings.cache.retry_delay_ms = 1;
        let pipeline = UpdaterPipeline::from_settings(
            &settings,
            retriever.clone(),
            loader,
            index.clone(),
            &MapperRegistry::with_defaults(),
        )
        .unwrap();

        Fixture {
            retriever,
            index,
            pipeline,
        }
    }

    fn thing(revision: i64) -> serde_json::Value {
        json!({ "thingId": "t", "policyId": "p", "_revision": revision, "attributes": { "a": revision } })
    }

    #[test]
    fn test_unknown_mapper_is_rejected() {
        let mut settings = Settings::default();
        settings.updater.mapper = "fancy".to_string();
        let result = UpdaterPipeline::from_settings(
            &settings,
            Arc::new(MapRetriever::default()),
            Arc::new(MapLoader::default()),
            Arc::new(InMemoryIndex::new()),
            &MapperRegistry::with_defaults(),
        );
        assert!(matches!(result, Err(IndexingError::UnknownMapper(_))));
    }

    #[tokio::test]
    async fn test_process_batch_writes_and_acks() {
        let fx = fixture(Duration::ZERO);
        fx.retriever.insert("t", thing(3));
        let (queue, _task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(CancellationToken::new());

        let (recipient, mut rx) = AckRecipient::channel("c1");
        let mut batch = ChangeBatch::new();
        batch.insert(
            ThingId::new("t"),
            ChangeMetadata::new("t", 3).with_ack_recipient(recipient),
        );

        let result = fx.pipeline.process_batch(batch, &queue).await;
        assert_eq!(result.statuses, vec![BulkWriteStatus::Ok]);
        assert_eq!(result.acked, 1);
        assert!(rx.recv().await.unwrap().is_success());
        assert_eq!(fx.index.get(&ThingId::new("t")).unwrap().thing_revision, 3);
        assert_eq!(fx.pipeline.stats().snapshot().acked, 1);
    }

    #[tokio::test]
    async fn test_unmatched_patch_is_requeued_as_full_retry() {
        let fx = fixture(Duration::ZERO);
        fx.retriever.insert("t", thing(5));
        fx.index.insert(SearchDocument {
            thing_id: ThingId::new("t"),
            thing_revision: 2,
            policy_id: None,
            policy_revision: None,
            modified: None,
            global_readers: BTreeSet::new(),
            entries: Vec::new(),
        });
        let (queue, _task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(CancellationToken::new());

        let (recipient, mut rx) = AckRecipient::channel("c1");
        let change = ChangeMetadata::new("t", 5)
            .with_events(vec![ThingEvent::new(5, ThingEventKind::Modified, "/attributes/a")])
            .with_ack_recipient(recipient);
        let mut batch = ChangeBatch::new();
        batch.insert(ThingId::new("t"), change);

        let result = fx.pipeline.process_batch(batch, &queue).await;
        assert_eq!(result.statuses, vec![BulkWriteStatus::IncorrectPatch]);
        assert_eq!(result.retried, 1);
        assert!(rx.try_recv().is_err());

        let retry = queue.drain(Lane::AckRequired).await.unwrap();
        assert!(retry[&ThingId::new("t")].invalidate_thing);

        let result = fx.pipeline.process_batch(retry, &queue).await;
        assert_eq!(result.statuses, vec![BulkWriteStatus::Ok]);
        assert!(rx.recv().await.unwrap().is_success());
        assert_eq!(fx.index.get(&ThingId::new("t")).unwrap().thing_revision, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_pipeline_processes_enqueued_changes() {
        let fx = fixture(Duration::from_millis(100));
        fx.retriever.insert("t", thing(1));
        let index = fx.index.clone();
        let running = fx.pipeline.spawn(CancellationToken::new());

        let (recipient, mut rx) = AckRecipient::channel("c1");
        running
            .queue()
            .enqueue(ChangeMetadata::new("t", 1).with_ack_recipient(recipient))
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().is_success());
        assert_eq!(index.len(), 1);
        running.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_shutdown_is_nacked() {
        let fx = fixture(Duration::from_secs(3600));
        let running = fx.pipeline.spawn(CancellationToken::new());
        let queue = running.queue();
        running.shutdown().await;

        let (recipient, mut rx) = AckRecipient::channel("c1");
        let result = queue
            .enqueue(ChangeMetadata::new("t", 1).with_ack_recipient(recipient))
            .await;
        assert!(matches!(result, Err(IndexingError::QueueClosed)));
        assert!(!rx.recv().await.unwrap().is_success());
    }
}
