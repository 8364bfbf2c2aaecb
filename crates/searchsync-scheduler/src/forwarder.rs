//! Stream forwarder.
//!
//! Consumes the stream of one trigger, hands every element to the recipient
//! with an acknowledgement callback attached, and waits until every forwarded
//! element was acknowledged. A forwarder ends
//!
//! - successfully once the stream ended and no acknowledgement is pending,
//! - immediately on the first failure (stream error, delivery error or
//!   negative acknowledgement),
//! - after the idle timeout passed without any activity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use searchsync_indexing::RepairStream;
use searchsync_types::{AckRecipient, AckStatus, ChangeMetadata};

use crate::trigger::StreamTrigger;
use crate::SchedulerError;

/// Produces the changes of one query window.
pub trait StreamProvider: Send + Sync {
    fn start_streaming(&self, trigger: &StreamTrigger) -> RepairStream;
}

/// Receives forwarded changes.
#[async_trait]
pub trait StreamRecipient: Send + Sync {
    async fn deliver(&self, change: ChangeMetadata) -> Result<(), SchedulerError>;
}

/// How a forwarder ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderOutcome {
    /// Everything forwarded and acknowledged
    Completed { forwarded: usize },
    Failed(String),
    /// No activity for the idle timeout
    IdleTimeout { pending: usize },
}

impl ForwarderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ForwarderOutcome::Completed { .. })
    }
}

/// Forwards one trigger's stream.
pub struct Forwarder {
    sync_type: String,
    provider: Arc<dyn StreamProvider>,
    recipient: Arc<dyn StreamRecipient>,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        sync_type: impl Into<String>,
        provider: Arc<dyn StreamProvider>,
        recipient: Arc<dyn StreamRecipient>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            sync_type: sync_type.into(),
            provider,
            recipient,
            idle_timeout,
        }
    }

    pub async fn run(self, trigger: StreamTrigger, cancel: CancellationToken) -> ForwarderOutcome {
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let mut stream = self.provider.start_streaming(&trigger);
        let mut stream_done = false;
        let mut expected: HashSet<String> = HashSet::new();
        let mut forwarded = 0usize;

        info!(sync_type = %self.sync_type, trigger = %trigger, "Forwarder started");
        loop {
            if stream_done && expected.is_empty() {
                info!(sync_type = %self.sync_type, forwarded, "Forwarder completed");
                return ForwarderOutcome::Completed { forwarded };
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return ForwarderOutcome::Failed("forwarder cancelled".to_string());
                }
                item = stream.next(), if !stream_done => match item {
                    Some(Ok(change)) => {
                        let correlation_id = Ulid::new().to_string();
                        let thing_id = change.thing_id.clone();
                        let change = change
                            .with_ack_recipient(AckRecipient::new(correlation_id.clone(), ack_tx.clone()));
                        expected.insert(correlation_id);
                        if let Err(e) = self.recipient.deliver(change).await {
                            warn!(sync_type = %self.sync_type, thing_id = %thing_id, error = %e, "Delivery failed");
                            return ForwarderOutcome::Failed(e.to_string());
                        }
                        forwarded += 1;
                        debug!(sync_type = %self.sync_type, thing_id = %thing_id, "Forwarded");
                    }
                    Some(Err(e)) => {
                        warn!(sync_type = %self.sync_type, error = %e, "Stream failed");
                        return ForwarderOutcome::Failed(e.to_string());
                    }
                    None => stream_done = true,
                },
                ack = ack_rx.recv() => match ack {
                    Some(ack) => {
                        expected.remove(&ack.correlation_id);
                        if let AckStatus::Failure(reason) = ack.status {
                            warn!(
                                sync_type = %self.sync_type,
                                thing_id = %ack.thing_id,
                                reason = %reason,
                                "Forwarded change failed"
                            );
                            return ForwarderOutcome::Failed(reason);
                        }
                    }
                    None => return ForwarderOutcome::Failed("acknowledgement channel closed".to_string()),
                },
                _ = tokio::time::sleep(self.idle_timeout) => {
                    warn!(
                        sync_type = %self.sync_type,
                        pending = expected.len(),
                        stream_done,
                        "Forwarder idle, giving up"
                    );
                    return ForwarderOutcome::IdleTimeout { pending: expected.len() };
                }
            }
        }
    }
}
