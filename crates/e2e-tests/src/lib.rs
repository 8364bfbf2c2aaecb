//! End-to-end test infrastructure for searchsync.
//!
//! Provides in-memory stand-ins for the authoritative thing store and the
//! policy store, plus a `TestHarness` running the full updater pipeline
//! against an in-memory index.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use searchsync_indexing::{
    BackgroundSync, BackgroundSyncConfig, EnforcerLoader, InMemoryIndex, MapperRegistry,
    MetadataSource, MetadataStream, ProviderError, RunningPipeline, ThingRetriever,
    UpdaterPipeline,
};
use searchsync_scheduler::jobs::ModifiedThingsSource;
use searchsync_types::{
    AckRecipient, Acknowledgement, ChangeMetadata, PolicyEnforcer, PolicyId, Settings,
    SyncMetadata, ThingEvent, ThingId,
};

/// How long tests wait for an acknowledgement or an index state.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct StoredThing {
    revision: i64,
    policy_id: PolicyId,
    modified: DateTime<Utc>,
    value: Value,
}

/// Authoritative thing store.
#[derive(Default)]
pub struct ThingStore {
    things: RwLock<BTreeMap<ThingId, StoredThing>>,
}

impl ThingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a thing revision governed by `policy_id`.
    pub fn put(
        &self,
        thing_id: &str,
        revision: i64,
        policy_id: &str,
        attributes: Value,
        modified: DateTime<Utc>,
    ) {
        let value = json!({
            "thingId": thing_id,
            "policyId": policy_id,
            "_revision": revision,
            "_modified": modified.to_rfc3339(),
            "attributes": attributes,
        });
        self.things.write().unwrap().insert(
            ThingId::new(thing_id),
            StoredThing {
                revision,
                policy_id: PolicyId::new(policy_id),
                modified,
                value,
            },
        );
    }

    pub fn remove(&self, thing_id: &str) {
        self.things.write().unwrap().remove(&ThingId::new(thing_id));
    }

    fn lookup(&self, thing_id: &ThingId) -> Option<Value> {
        self.things
            .read()
            .unwrap()
            .get(thing_id)
            .map(|thing| thing.value.clone())
    }

    fn metadata_where(&self, keep: impl Fn(&StoredThing) -> bool) -> Vec<SyncMetadata> {
        self.things
            .read()
            .unwrap()
            .iter()
            .filter(|(_, thing)| keep(thing))
            .map(|(thing_id, thing)| {
                let mut meta =
                    SyncMetadata::new(thing_id.clone(), thing.revision).with_modified(thing.modified);
                meta.policy_id = Some(thing.policy_id.clone());
                meta
            })
            .collect()
    }
}

#[async_trait]
impl ThingRetriever for ThingStore {
    async fn retrieve_full(
        &self,
        thing_id: &ThingId,
        _field_selector: Option<&str>,
    ) -> Result<Option<Value>, ProviderError> {
        Ok(self.lookup(thing_id))
    }

    async fn retrieve_partial(
        &self,
        thing_id: &ThingId,
        _field_selector: Option<&str>,
        _target_revision: i64,
        _events: &[ThingEvent],
    ) -> Result<Option<Value>, ProviderError> {
        Ok(self.lookup(thing_id))
    }
}

impl MetadataSource for ThingStore {
    fn metadata_stream(&self) -> MetadataStream {
        stream::iter(self.metadata_where(|_| true).into_iter().map(Ok)).boxed()
    }
}

impl ModifiedThingsSource for ThingStore {
    fn modified_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> MetadataStream {
        let items = self.metadata_where(|thing| thing.modified >= start && thing.modified < end);
        stream::iter(items.into_iter().map(Ok)).boxed()
    }
}

/// Policy store serving enforcers.
#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<PolicyId, PolicyEnforcer>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, enforcer: PolicyEnforcer) {
        self.policies
            .write()
            .unwrap()
            .insert(enforcer.policy_id.clone(), enforcer);
    }

    pub fn remove(&self, policy_id: &str) {
        self.policies.write().unwrap().remove(&PolicyId::new(policy_id));
    }
}

#[async_trait]
impl EnforcerLoader for PolicyStore {
    async fn load(&self, policy_id: &PolicyId) -> Result<Option<PolicyEnforcer>, ProviderError> {
        Ok(self.policies.read().unwrap().get(policy_id).cloned())
    }
}

/// Shared test harness running the updater pipeline.
pub struct TestHarness {
    pub things: Arc<ThingStore>,
    pub policies: Arc<PolicyStore>,
    pub index: Arc<InMemoryIndex>,
    pub pipeline: RunningPipeline,
}

impl TestHarness {
    /// Start a pipeline with fast drains over empty stores.
    pub fn start() -> Self {
        let mut settings = Settings::default();
        settings.updater.drain_interval_ms = 5;
        settings.cache.retry_delay_ms = 5;

        let things = Arc::new(ThingStore::new());
        let policies = Arc::new(PolicyStore::new());
        let index = Arc::new(InMemoryIndex::new());

        let pipeline = UpdaterPipeline::from_settings(
            &settings,
            things.clone(),
            policies.clone(),
            index.clone(),
            &MapperRegistry::with_defaults(),
        )
        .expect("Failed to build pipeline")
        .spawn(CancellationToken::new());

        Self {
            things,
            policies,
            index,
            pipeline,
        }
    }

    /// Enqueue a change and wait for its acknowledgement.
    pub async fn apply(&self, change: ChangeMetadata) -> Acknowledgement {
        let (ack, mut rx) = AckRecipient::channel(format!("e2e-{}", change.thing_id));
        self.pipeline
            .queue()
            .enqueue(change.with_ack_recipient(ack))
            .await
            .expect("Failed to enqueue change");
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for acknowledgement")
            .expect("Acknowledgement channel closed")
    }

    /// Background sync comparing the thing store against the index.
    pub fn background_sync(&self, tolerance_window: Duration) -> BackgroundSync {
        BackgroundSync::new(
            self.things.clone(),
            self.index.clone(),
            self.pipeline.cache(),
            BackgroundSyncConfig::default()
                .with_tolerance_window(tolerance_window)
                .with_throttle(100, Duration::from_millis(10)),
        )
    }

    /// Poll until `check` holds on the index or the wait expires.
    pub async fn wait_for_index(&self, check: impl Fn(&InMemoryIndex) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check(&self.index) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(&self.index)
    }

    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}

/// A modification time outside any tolerance window used in tests.
pub fn long_ago() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(2)
}

/// Enforcer granting `reader` read access to the whole thing.
pub fn open_policy(policy_id: &str, revision: i64, reader: &str) -> PolicyEnforcer {
    PolicyEnforcer::new(policy_id, revision).grant(reader, "/")
}
