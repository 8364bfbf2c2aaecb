//! Policy enforcer cache.
//!
//! Maps a policy id to a shared, lazily loaded enforcer. Concurrent lookups of
//! the same policy share one in-flight load. Entries expire after a TTL, are
//! evicted LRU beyond the configured capacity, and can be invalidated
//! explicitly. Loader errors are cached as "nonexistent" like a missing policy.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use searchsync_types::{CacheSettings, PolicyEnforcer, PolicyId};

use crate::error::ProviderError;

/// Loads enforcers from the policy store.
#[async_trait]
pub trait EnforcerLoader: Send + Sync {
    /// Load the current enforcer of a policy. `Ok(None)` means the policy does not exist.
    async fn load(&self, policy_id: &PolicyId) -> Result<Option<PolicyEnforcer>, ProviderError>;
}

/// Configuration for the enforcer cache.
#[derive(Debug, Clone)]
pub struct EnforcerCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
    /// Delay before the single retry on a missing or stale enforcer
    pub retry_delay: Duration,
}

impl Default for EnforcerCacheConfig {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

impl EnforcerCacheConfig {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            ttl: settings.ttl(),
            capacity: settings.capacity,
            retry_delay: settings.retry_delay(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

type EnforcerFuture = Shared<BoxFuture<'static, Option<Arc<PolicyEnforcer>>>>;

struct CacheEntry {
    future: EnforcerFuture,
    created_at: Instant,
}

/// Revision-aware enforcer cache.
pub struct EnforcerCache {
    loader: Arc<dyn EnforcerLoader>,
    entries: Mutex<LruCache<PolicyId, CacheEntry>>,
    config: EnforcerCacheConfig,
}

impl EnforcerCache {
    pub fn new(loader: Arc<dyn EnforcerLoader>, config: EnforcerCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            entries: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    pub fn config(&self) -> &EnforcerCacheConfig {
        &self.config
    }

    /// Cached enforcer of a policy, loading it if absent or expired.
    pub async fn get(&self, policy_id: &PolicyId) -> Option<Arc<PolicyEnforcer>> {
        let future = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(policy_id) {
                Some(entry) if entry.created_at.elapsed() < self.config.ttl => entry.future.clone(),
                _ => {
                    let future = self.load_shared(policy_id.clone());
                    entries.put(
                        policy_id.clone(),
                        CacheEntry {
                            future: future.clone(),
                            created_at: Instant::now(),
                        },
                    );
                    future
                }
            }
        };
        future.await
    }

    /// Revision of the cached enforcer of a policy.
    pub async fn get_revision(&self, policy_id: &PolicyId) -> Option<i64> {
        self.get(policy_id).await.map(|enforcer| enforcer.revision)
    }

    /// Drop the cached entry so the next lookup reloads. Returns whether one existed.
    pub fn invalidate(&self, policy_id: &PolicyId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(policy_id).is_some()
    }

    /// Lookup with a single retry.
    ///
    /// If the cached enforcer is missing, nonexistent, or older than
    /// `min_revision`, the entry is invalidated and reloaded once after the
    /// retry delay; the reloaded result is accepted as is.
    pub async fn get_at_least(
        &self,
        policy_id: &PolicyId,
        min_revision: Option<i64>,
    ) -> Option<Arc<PolicyEnforcer>> {
        let first = self.get(policy_id).await;
        if is_usable(first.as_deref(), min_revision) {
            return first;
        }

        debug!(
            policy_id = %policy_id,
            cached_revision = ?first.as_ref().map(|e| e.revision),
            min_revision = ?min_revision,
            "Enforcer missing or stale, retrying once"
        );
        self.invalidate(policy_id);
        tokio::time::sleep(self.config.retry_delay).await;
        self.get(policy_id).await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_shared(&self, policy_id: PolicyId) -> EnforcerFuture {
        let loader = self.loader.clone();
        async move {
            match loader.load(&policy_id).await {
                Ok(enforcer) => enforcer.map(Arc::new),
                Err(e) => {
                    warn!(policy_id = %policy_id, error = %e, "Failed to load enforcer");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn is_usable(enforcer: Option<&PolicyEnforcer>, min_revision: Option<i64>) -> bool {
    match (enforcer, min_revision) {
        (None, _) => false,
        (Some(enforcer), Some(min)) => enforcer.revision >= min,
        (Some(_), None) => true,
    }
}
