//! Change queue recipient.

use async_trait::async_trait;

use searchsync_indexing::ChangeQueueHandle;
use searchsync_types::{ChangeMetadata, LatencyTimer};

use crate::forwarder::StreamRecipient;
use crate::SchedulerError;

/// Hands forwarded changes to the updater's change queue.
///
/// Forwarded changes always carry an acknowledgement recipient, so each gets
/// a latency timer for the ack-required lane.
#[derive(Clone)]
pub struct ChangeQueueRecipient {
    queue: ChangeQueueHandle,
}

impl ChangeQueueRecipient {
    pub fn new(queue: ChangeQueueHandle) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl StreamRecipient for ChangeQueueRecipient {
    async fn deliver(&self, change: ChangeMetadata) -> Result<(), SchedulerError> {
        let ack_required = change.requires_ack();
        self.queue
            .enqueue(change.with_timer(LatencyTimer::start(ack_required)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsync_indexing::{ChangeQueue, ChangeQueueConfig, IndexingError, Lane};
    use searchsync_types::{AckRecipient, ThingId};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_delivers_into_ack_lane() {
        let cancel = CancellationToken::new();
        let (queue, _task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(cancel.clone());
        let recipient = ChangeQueueRecipient::new(queue.clone());

        let (ack, _rx) = AckRecipient::channel("c1");
        recipient
            .deliver(ChangeMetadata::new("t1", 1).with_ack_recipient(ack))
            .await
            .unwrap();

        let batch = queue.drain(Lane::AckRequired).await.unwrap();
        let change = &batch[&ThingId::new("t1")];
        assert_eq!(change.timers().len(), 1);
        assert!(change.timers()[0].ack_required());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_queue_nacks_and_errors() {
        let cancel = CancellationToken::new();
        let (queue, task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(cancel.clone());
        cancel.cancel();
        task.await.unwrap();

        let recipient = ChangeQueueRecipient::new(queue);
        let (ack, mut rx) = AckRecipient::channel("c1");
        let err = recipient
            .deliver(ChangeMetadata::new("t1", 1).with_ack_recipient(ack))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Indexing(IndexingError::QueueClosed)));
        assert!(!rx.recv().await.unwrap().is_success());
    }
}
