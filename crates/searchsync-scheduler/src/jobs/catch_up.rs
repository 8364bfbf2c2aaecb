//! Catch-up workload.
//!
//! Forwards every entity of the authoritative store modified inside the
//! trigger window as a repair change, without comparing against the index.
//! It closes gaps left by change notifications lost in transit.

use std::sync::Arc;

use futures::StreamExt;

use searchsync_indexing::{MetadataStream, RepairStream};
use searchsync_types::ChangeMetadata;

use crate::forwarder::StreamProvider;
use crate::trigger::StreamTrigger;

/// Sync type of the catch-up stream.
pub const CATCH_UP: &str = "catch-up";

/// Authoritative store view queried by modification time.
pub trait ModifiedThingsSource: Send + Sync {
    /// Metadata of every entity modified in `[start, end)`.
    fn modified_between(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> MetadataStream;
}

/// Stream provider re-forwarding recently modified entities.
pub struct CatchUpProvider {
    source: Arc<dyn ModifiedThingsSource>,
}

impl CatchUpProvider {
    pub fn new(source: Arc<dyn ModifiedThingsSource>) -> Self {
        Self { source }
    }
}

impl StreamProvider for CatchUpProvider {
    fn start_streaming(&self, trigger: &StreamTrigger) -> RepairStream {
        self.source
            .modified_between(trigger.query_start, trigger.query_end)
            .map(|item| {
                item.map(|meta| {
                    let mut change = ChangeMetadata::new(meta.thing_id, meta.thing_revision);
                    change.policy_id = meta.policy_id;
                    change.policy_revision = meta.policy_revision;
                    change.modified = meta.modified;
                    change.invalidating_thing()
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use futures::{stream, TryStreamExt};
    use searchsync_indexing::ProviderError;
    use searchsync_types::SyncMetadata;

    struct Timeline(Vec<SyncMetadata>);

    impl ModifiedThingsSource for Timeline {
        fn modified_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> MetadataStream {
            let items: Vec<_> = self
                .0
                .iter()
                .filter(|m| m.modified.is_some_and(|t| t >= start && t < end))
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(items).boxed()
        }
    }

    struct Broken;

    impl ModifiedThingsSource for Broken {
        fn modified_between(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> MetadataStream {
            stream::iter(vec![Err(ProviderError::Unavailable("store".to_string()))]).boxed()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn trigger(start: i64, end: i64) -> StreamTrigger {
        StreamTrigger {
            query_start: at(start),
            query_end: at(end),
            planned_stream_start: at(end),
        }
    }

    #[tokio::test]
    async fn test_forwards_window_as_repairs() {
        let provider = CatchUpProvider::new(Arc::new(Timeline(vec![
            SyncMetadata::new("early", 1).with_modified(at(10)),
            SyncMetadata::new("inside", 3).with_policy("p", 2).with_modified(at(150)),
            SyncMetadata::new("edge", 1).with_modified(at(300)),
        ])));

        let changes: Vec<_> = provider
            .start_streaming(&trigger(100, 300))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.thing_id.as_str(), "inside");
        assert_eq!(change.thing_revision, 3);
        assert_eq!(change.policy_revision, Some(2));
        assert!(change.invalidate_thing);
    }

    #[tokio::test]
    async fn test_source_errors_are_passed_on() {
        let provider = CatchUpProvider::new(Arc::new(Broken));
        let result: Result<Vec<_>, _> = provider.start_streaming(&trigger(0, 300)).try_collect().await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
