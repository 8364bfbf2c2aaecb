//! Enforcement stage.
//!
//! Turns a drained batch into one write model per thing: retrieve the current
//! thing (incrementally when the recorded events allow it), resolve the policy
//! enforcer through the cache, and map the pair to an update. Things that are
//! gone, or whose enforcer cannot be resolved, become deletes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use searchsync_types::{
    is_contiguous, ChangeMetadata, LatencySegment, PolicyId, ThingEvent, ThingId,
    UpdaterSettings, WriteModel,
};

use crate::cache::EnforcerCache;
use crate::error::ProviderError;
use crate::mapper::SearchUpdateMapper;
use crate::queue::ChangeBatch;

/// Facade of the authoritative entity store.
#[async_trait]
pub trait ThingRetriever: Send + Sync {
    /// Fetch the complete current thing. `Ok(None)` means it does not exist.
    async fn retrieve_full(
        &self,
        thing_id: &ThingId,
        field_selector: Option<&str>,
    ) -> Result<Option<Value>, ProviderError>;

    /// Fetch the thing at `target_revision`, enriching a cached copy with `events`.
    async fn retrieve_partial(
        &self,
        thing_id: &ThingId,
        field_selector: Option<&str>,
        target_revision: i64,
        events: &[ThingEvent],
    ) -> Result<Option<Value>, ProviderError>;
}

/// Configuration for the enforcement stage.
#[derive(Debug, Clone)]
pub struct EnforcementConfig {
    /// Concurrent things processed per batch
    pub parallelism: usize,
    pub field_selector: Option<String>,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self::from_settings(&UpdaterSettings::default())
    }
}

impl EnforcementConfig {
    pub fn from_settings(settings: &UpdaterSettings) -> Self {
        Self {
            parallelism: settings.parallelism.max(1),
            field_selector: settings.field_selector.clone(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// Enforcement and enrichment of drained changes.
pub struct EnforcementStage {
    retriever: Arc<dyn ThingRetriever>,
    cache: Arc<EnforcerCache>,
    mapper: Arc<dyn SearchUpdateMapper>,
    config: EnforcementConfig,
}

impl EnforcementStage {
    pub fn new(
        retriever: Arc<dyn ThingRetriever>,
        cache: Arc<EnforcerCache>,
        mapper: Arc<dyn SearchUpdateMapper>,
        config: EnforcementConfig,
    ) -> Self {
        Self {
            retriever,
            cache,
            mapper,
            config,
        }
    }

    /// Produce one write model per change, with bounded concurrency.
    pub async fn process_batch(&self, batch: ChangeBatch) -> Vec<WriteModel> {
        stream::iter(batch.into_values())
            .map(|change| self.to_write_model(change))
            .buffer_unordered(self.config.parallelism)
            .collect()
            .await
    }

    /// Produce the write model of a single change.
    pub async fn to_write_model(&self, mut metadata: ChangeMetadata) -> WriteModel {
        metadata.start_segment(LatencySegment::RetrieveThing);

        if metadata.events.last().is_some_and(ThingEvent::is_thing_deletion) {
            debug!(thing_id = %metadata.thing_id, "Thing deleted, writing tombstone");
            return into_delete(metadata);
        }

        let base_revision = incremental_base(&metadata);
        let Some(thing) = self.retrieve(&metadata, base_revision).await else {
            debug!(thing_id = %metadata.thing_id, "Thing absent, writing tombstone");
            return into_delete(metadata);
        };

        metadata.start_segment(LatencySegment::GetEnforcer);
        // the retrieved thing knows its current policy better than the change
        let policy_id = policy_id_of(&thing).or_else(|| metadata.policy_id.clone());
        let min_revision = if policy_id == metadata.policy_id {
            metadata.policy_revision
        } else {
            None
        };
        let enforcer = match &policy_id {
            Some(policy_id) => {
                if metadata.invalidate_policy {
                    self.cache.invalidate(policy_id);
                }
                self.cache.get_at_least(policy_id, min_revision).await
            }
            None => None,
        };

        metadata.start_segment(LatencySegment::ToWriteModel);
        match enforcer {
            Some(enforcer) => self
                .mapper
                .to_write_model(metadata, &thing, &enforcer, base_revision),
            None => {
                warn!(
                    thing_id = %metadata.thing_id,
                    policy_id = ?policy_id.as_ref().map(PolicyId::as_str),
                    "No enforcer for existing thing, writing tombstone"
                );
                into_delete(metadata)
            }
        }
    }

    async fn retrieve(&self, metadata: &ChangeMetadata, base_revision: Option<i64>) -> Option<Value> {
        let selector = self.config.field_selector.as_deref();
        let result = match base_revision {
            Some(_) => {
                self.retriever
                    .retrieve_partial(
                        &metadata.thing_id,
                        selector,
                        metadata.thing_revision,
                        &metadata.events,
                    )
                    .await
            }
            None => self.retriever.retrieve_full(&metadata.thing_id, selector).await,
        };
        match result {
            Ok(thing) => thing,
            Err(ProviderError::NotFound(_)) => None,
            Err(e) => {
                warn!(thing_id = %metadata.thing_id, error = %e, "Thing retrieval failed, treating as absent");
                None
            }
        }
    }
}

/// Indexed revision an incremental update builds on, if the change allows one.
///
/// Incremental retrieval needs an unbroken event sequence up to the target
/// revision that does not start with the creation of the thing.
pub fn incremental_base(metadata: &ChangeMetadata) -> Option<i64> {
    if metadata.invalidate_thing || !is_contiguous(&metadata.events, metadata.thing_revision) {
        return None;
    }
    let first = metadata.events.first()?;
    if first.is_creation() {
        return None;
    }
    Some(first.revision - 1)
}

fn policy_id_of(thing: &Value) -> Option<PolicyId> {
    thing
        .get("policyId")
        .and_then(Value::as_str)
        .map(PolicyId::new)
}

fn into_delete(mut metadata: ChangeMetadata) -> WriteModel {
    metadata.start_segment(LatencySegment::ToWriteModel);
    WriteModel::Delete { metadata }
}
