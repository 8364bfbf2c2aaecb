//! Background sync between the authoritative store and the search index.
//!
//! Both sides deliver their per-thing [`SyncMetadata`] ordered by thing id.
//! The two sequences are merged pairwise by id; every pair is compared and
//! turned into at most one repair change, which is fed back into the change
//! queue like any other change. Pairs are throttled to a fixed number per
//! period before comparison so the sync never competes with live traffic.
//!
//! Mismatches younger than the tolerance window are presumed to be in flight
//! through the regular pipeline and are skipped.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_stream::{stream, try_stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::debug;

use searchsync_types::{BackgroundSyncSettings, ChangeMetadata, PolicyId, SyncMetadata};

use crate::cache::EnforcerCache;
use crate::error::ProviderError;

/// Metadata of one side, ordered by thing id.
pub type MetadataStream = BoxStream<'static, Result<SyncMetadata, ProviderError>>;

/// Authoritative and indexed metadata of the same id. The side missing an
/// entry carries [`SyncMetadata::sentinel`].
pub type MetadataPair = (SyncMetadata, SyncMetadata);

/// Stream of repair changes.
pub type RepairStream = BoxStream<'static, Result<ChangeMetadata, ProviderError>>;

/// Source of per-thing metadata ordered by thing id.
pub trait MetadataSource: Send + Sync {
    fn metadata_stream(&self) -> MetadataStream;
}

/// Current policy revisions, as seen by enforcement.
#[async_trait]
pub trait PolicyRevisions: Send + Sync {
    /// Revision of a policy, `None` if it does not exist.
    async fn current_revision(&self, policy_id: &PolicyId) -> Option<i64>;

    /// Drop any cached knowledge about a policy.
    fn invalidate(&self, _policy_id: &PolicyId) {}
}

#[async_trait]
impl PolicyRevisions for EnforcerCache {
    async fn current_revision(&self, policy_id: &PolicyId) -> Option<i64> {
        self.get_revision(policy_id).await
    }

    fn invalidate(&self, policy_id: &PolicyId) {
        EnforcerCache::invalidate(self, policy_id);
    }
}

/// Configuration for background sync.
#[derive(Debug, Clone)]
pub struct BackgroundSyncConfig {
    /// Mismatches of entries modified more recently than this are skipped
    pub tolerance_window: Duration,
    /// Pairs compared per throttle period; 0 disables throttling
    pub throttle_elements: usize,
    pub throttle_period: Duration,
}

impl Default for BackgroundSyncConfig {
    fn default() -> Self {
        Self::from_settings(&BackgroundSyncSettings::default())
    }
}

impl BackgroundSyncConfig {
    pub fn from_settings(settings: &BackgroundSyncSettings) -> Self {
        Self {
            tolerance_window: settings.tolerance_window(),
            throttle_elements: settings.throttle_elements,
            throttle_period: settings.throttle_period(),
        }
    }

    pub fn with_tolerance_window(mut self, window: Duration) -> Self {
        self.tolerance_window = window;
        self
    }

    pub fn with_throttle(mut self, elements: usize, period: Duration) -> Self {
        self.throttle_elements = elements;
        self.throttle_period = period;
        self
    }
}

/// Merge two id-ordered metadata streams into pairs of equal id.
///
/// An id present on one side only is paired with the sentinel. The first error
/// of either side is yielded and ends the stream.
pub fn merge_by_id(
    authoritative: MetadataStream,
    indexed: MetadataStream,
) -> BoxStream<'static, Result<MetadataPair, ProviderError>> {
    let merged = try_stream! {
        let mut authoritative = authoritative;
        let mut indexed = indexed;
        let mut left = authoritative.next().await.transpose()?;
        let mut right = indexed.next().await.transpose()?;

        loop {
            match (left.take(), right.take()) {
                (None, None) => break,
                (Some(a), None) => {
                    yield (a, SyncMetadata::sentinel());
                    left = authoritative.next().await.transpose()?;
                }
                (None, Some(i)) => {
                    yield (SyncMetadata::sentinel(), i);
                    right = indexed.next().await.transpose()?;
                }
                (Some(a), Some(i)) => match a.compare_ids(&i) {
                    Ordering::Less => {
                        yield (a, SyncMetadata::sentinel());
                        left = authoritative.next().await.transpose()?;
                        right = Some(i);
                    }
                    Ordering::Greater => {
                        yield (SyncMetadata::sentinel(), i);
                        right = indexed.next().await.transpose()?;
                        left = Some(a);
                    }
                    Ordering::Equal => {
                        yield (a, i);
                        left = authoritative.next().await.transpose()?;
                        right = indexed.next().await.transpose()?;
                    }
                },
            }
        }
    };
    Box::pin(merged)
}

/// Limit a stream to `elements` items per `period`. `elements == 0` passes
/// the stream through unchanged.
pub fn throttle<S>(inner: S, elements: usize, period: Duration) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    if elements == 0 {
        return inner.boxed();
    }
    let throttled = stream! {
        let mut inner = Box::pin(inner);
        let mut window_start = Instant::now();
        let mut emitted = 0usize;
        while let Some(item) = inner.next().await {
            if window_start.elapsed() >= period {
                window_start = Instant::now();
                emitted = 0;
            }
            if emitted >= elements {
                tokio::time::sleep_until(window_start + period).await;
                window_start = Instant::now();
                emitted = 0;
            }
            emitted += 1;
            yield item;
        }
    };
    Box::pin(throttled)
}

/// Compares the authoritative store against the index.
#[derive(Clone)]
pub struct BackgroundSync {
    authoritative: Arc<dyn MetadataSource>,
    indexed: Arc<dyn MetadataSource>,
    policies: Arc<dyn PolicyRevisions>,
    config: BackgroundSyncConfig,
}

impl BackgroundSync {
    pub fn new(
        authoritative: Arc<dyn MetadataSource>,
        indexed: Arc<dyn MetadataSource>,
        policies: Arc<dyn PolicyRevisions>,
        config: BackgroundSyncConfig,
    ) -> Self {
        Self {
            authoritative,
            indexed,
            policies,
            config,
        }
    }

    pub fn config(&self) -> &BackgroundSyncConfig {
        &self.config
    }

    /// Stream of repair changes over both sides. Pairs are throttled before
    /// comparison, so policy lookups never outpace the configured rate.
    pub fn repair_stream(&self) -> RepairStream {
        let this = self.clone();
        let pairs = throttle(
            merge_by_id(
                self.authoritative.metadata_stream(),
                self.indexed.metadata_stream(),
            ),
            self.config.throttle_elements,
            self.config.throttle_period,
        );
        pairs
            .then(move |pair| {
                let this = this.clone();
                async move {
                    match pair {
                        Ok((authoritative, indexed)) => {
                            Ok(this.compare(&authoritative, &indexed, Utc::now()).await)
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .filter_map(|repair| async move { repair.transpose() })
            .boxed()
    }

    /// Compare one pair and build the repair it needs, if any.
    pub async fn compare(
        &self,
        authoritative: &SyncMetadata,
        indexed: &SyncMetadata,
        now: DateTime<Utc>,
    ) -> Option<ChangeMetadata> {
        if indexed.is_sentinel() {
            return self.compare_one_sided(authoritative, "missing_in_index", now).await;
        }
        if authoritative.is_sentinel() {
            return self.compare_one_sided(indexed, "missing_in_store", now).await;
        }
        if self.within_tolerance(indexed, now) {
            return None;
        }

        if indexed.thing_revision < authoritative.thing_revision {
            debug!(
                thing_id = %authoritative.thing_id,
                indexed_revision = indexed.thing_revision,
                revision = authoritative.thing_revision,
                "Index behind store"
            );
            return Some(repair(authoritative).invalidating_thing());
        }

        if indexed.policy_id != authoritative.policy_id {
            debug!(
                thing_id = %authoritative.thing_id,
                indexed_policy = ?indexed.policy_id,
                policy = ?authoritative.policy_id,
                "Policy id mismatch"
            );
            return Some(repair(authoritative).invalidating_policy());
        }

        let policy_id = authoritative.policy_id.as_ref()?;
        let mut current = self.policies.current_revision(policy_id).await;
        if current != indexed.policy_revision {
            self.policies.invalidate(policy_id);
            current = self.policies.current_revision(policy_id).await;
        }
        if current != indexed.policy_revision {
            debug!(
                thing_id = %authoritative.thing_id,
                policy_id = %policy_id,
                indexed_policy_revision = ?indexed.policy_revision,
                policy_revision = ?current,
                "Policy revision mismatch"
            );
            return Some(repair(authoritative).invalidating_policy());
        }
        None
    }

    async fn compare_one_sided(
        &self,
        present: &SyncMetadata,
        reason: &'static str,
        now: DateTime<Utc>,
    ) -> Option<ChangeMetadata> {
        if self.within_tolerance(present, now) {
            return None;
        }
        if !self.policy_exists(present.policy_id.as_ref()).await {
            debug!(thing_id = %present.thing_id, reason, "Skipping repair, policy gone");
            return None;
        }
        debug!(thing_id = %present.thing_id, revision = present.thing_revision, reason, "Repairing");
        Some(repair(present).invalidating_thing())
    }

    /// Whether the entry was modified within the tolerance window. Entries
    /// without a modification time are always old enough.
    fn within_tolerance(&self, meta: &SyncMetadata, now: DateTime<Utc>) -> bool {
        meta.modified.is_some_and(|modified| {
            now.signed_duration_since(modified)
                .to_std()
                .map_or(true, |age| age < self.config.tolerance_window)
        })
    }

    async fn policy_exists(&self, policy_id: Option<&PolicyId>) -> bool {
        let Some(policy_id) = policy_id else {
            return false;
        };
        if self.policies.current_revision(policy_id).await.is_some() {
            return true;
        }
        self.policies.invalidate(policy_id);
        self.policies.current_revision(policy_id).await.is_some()
    }
}

fn repair(meta: &SyncMetadata) -> ChangeMetadata {
    let mut change = ChangeMetadata::new(meta.thing_id.clone(), meta.thing_revision);
    change.policy_id = meta.policy_id.clone();
    change.policy_revision = meta.policy_revision;
    change.modified = meta.modified;
    change
}
