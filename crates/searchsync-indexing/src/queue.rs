//! Coalescing change queue.
//!
//! The queue is a single-writer actor holding one map per lane from thing id
//! to pending [`ChangeMetadata`]. Enqueued changes are merged with whatever is
//! already pending for the same thing; a drain swaps a lane's map for an empty
//! one so no change is ever handed out twice.
//!
//! Drain requests are parked and only served after the actor has processed a
//! burst of pending merges, bounded by `max_merge_burst`, so drains never jump
//! ahead of merges but cannot starve either.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use searchsync_types::{ChangeMetadata, LatencySegment, ThingId, UpdaterSettings};

use crate::error::IndexingError;

/// Batch of coalesced changes handed out by one drain.
pub type ChangeBatch = HashMap<ThingId, ChangeMetadata>;

/// Queue lane. Changes some originator waits on never share a batch with
/// changes nobody waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    AckRequired,
    Default,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::AckRequired, Lane::Default];

    pub fn name(&self) -> &'static str {
        match self {
            Lane::AckRequired => "ack_required",
            Lane::Default => "default",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the change queue actor.
#[derive(Debug, Clone)]
pub struct ChangeQueueConfig {
    /// Merges processed before parked drains are served
    pub max_merge_burst: usize,
    /// Capacity of the command channel
    pub channel_capacity: usize,
}

impl Default for ChangeQueueConfig {
    fn default() -> Self {
        Self {
            max_merge_burst: 256,
            channel_capacity: 1024,
        }
    }
}

impl ChangeQueueConfig {
    pub fn from_settings(settings: &UpdaterSettings) -> Self {
        Self::default().with_max_merge_burst(settings.max_merge_burst)
    }

    pub fn with_max_merge_burst(mut self, burst: usize) -> Self {
        self.max_merge_burst = burst.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

/// Number of pending things per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLengths {
    pub ack_required: usize,
    pub default: usize,
}

enum QueueCommand {
    Enqueue(ChangeMetadata),
    Drain {
        lane: Lane,
        reply: oneshot::Sender<ChangeBatch>,
    },
    Lengths {
        reply: oneshot::Sender<QueueLengths>,
    },
}

/// Cloneable handle to a running change queue.
#[derive(Clone)]
pub struct ChangeQueueHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl ChangeQueueHandle {
    /// Hand a change to the queue.
    ///
    /// If the queue is gone the change is negatively acknowledged before the
    /// error is returned, so its callbacks are still resolved.
    pub async fn enqueue(&self, change: ChangeMetadata) -> Result<(), IndexingError> {
        if let Err(mpsc::error::SendError(command)) =
            self.tx.send(QueueCommand::Enqueue(change)).await
        {
            if let QueueCommand::Enqueue(mut change) = command {
                change.send_nack("change queue closed");
            }
            return Err(IndexingError::QueueClosed);
        }
        Ok(())
    }

    /// Take every pending change of `lane`, waiting until there is at least one.
    pub async fn drain(&self, lane: Lane) -> Result<ChangeBatch, IndexingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Drain { lane, reply })
            .await
            .map_err(|_| IndexingError::QueueClosed)?;
        rx.await.map_err(|_| IndexingError::QueueClosed)
    }

    pub async fn lengths(&self) -> Result<QueueLengths, IndexingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Lengths { reply })
            .await
            .map_err(|_| IndexingError::QueueClosed)?;
        rx.await.map_err(|_| IndexingError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// State of the change queue actor.
pub struct ChangeQueue {
    config: ChangeQueueConfig,
    ack_required: ChangeBatch,
    default: ChangeBatch,
    parked: Vec<(Lane, oneshot::Sender<ChangeBatch>)>,
}

impl ChangeQueue {
    pub fn new(config: ChangeQueueConfig) -> Self {
        Self {
            config,
            ack_required: HashMap::new(),
            default: HashMap::new(),
            parked: Vec::new(),
        }
    }

    /// Merge a change into its lane.
    ///
    /// A thing is pending in at most one lane: an acknowledged change pulls any
    /// pending unacknowledged change of the same thing into the ack lane, and
    /// an unacknowledged change joins an already pending acknowledged one.
    /// Drained batches are not tracked; a thing may be pending again while an
    /// earlier batch of it is still being written, and the sink's revision
    /// guards order the two writes.
    pub fn enqueue(&mut self, mut change: ChangeMetadata) {
        change.start_segment(LatencySegment::Queued);
        let id = change.thing_id.clone();

        let lane = if change.requires_ack() || self.ack_required.contains_key(&id) {
            Lane::AckRequired
        } else {
            Lane::Default
        };
        if lane == Lane::AckRequired {
            if let Some(pending) = self.default.remove(&id) {
                change = pending.merge(change);
            }
        }

        let map = self.lane_mut(lane);
        let merged = match map.remove(&id) {
            Some(existing) => existing.merge(change),
            None => change,
        };
        debug!(thing_id = %id, revision = merged.thing_revision, lane = %lane, "Enqueued change");
        map.insert(id, merged);
    }

    /// Swap the lane's map for an empty one.
    pub fn drain(&mut self, lane: Lane) -> ChangeBatch {
        std::mem::take(self.lane_mut(lane))
    }

    pub fn lengths(&self) -> QueueLengths {
        QueueLengths {
            ack_required: self.ack_required.len(),
            default: self.default.len(),
        }
    }

    pub fn is_empty(&self, lane: Lane) -> bool {
        match lane {
            Lane::AckRequired => self.ack_required.is_empty(),
            Lane::Default => self.default.is_empty(),
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut ChangeBatch {
        match lane {
            Lane::AckRequired => &mut self.ack_required,
            Lane::Default => &mut self.default,
        }
    }

    /// Start the actor. The queue stops when `cancel` fires or every handle is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> (ChangeQueueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let handle = tokio::spawn(self.run(rx, cancel));
        (ChangeQueueHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<QueueCommand>, cancel: CancellationToken) {
        info!(max_merge_burst = self.config.max_merge_burst, "Change queue started");
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);

            let mut burst = 1;
            while burst < self.config.max_merge_burst {
                match rx.try_recv() {
                    Ok(command) => {
                        self.handle(command);
                        burst += 1;
                    }
                    Err(_) => break,
                }
            }

            self.serve_parked();
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            self.handle(command);
        }
        self.shutdown();
    }

    fn handle(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue(change) => self.enqueue(change),
            QueueCommand::Drain { lane, reply } => self.parked.push((lane, reply)),
            QueueCommand::Lengths { reply } => {
                let _ = reply.send(self.lengths());
            }
        }
    }

    fn serve_parked(&mut self) {
        let parked = std::mem::take(&mut self.parked);
        for (lane, reply) in parked {
            if reply.is_closed() {
                continue;
            }
            if self.is_empty(lane) {
                self.parked.push((lane, reply));
                continue;
            }
            let batch = self.drain(lane);
            debug!(lane = %lane, size = batch.len(), "Drained lane");
            if let Err(batch) = reply.send(batch) {
                // requester went away between the check and the send
                for change in batch.into_values() {
                    self.enqueue(change);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let mut dropped = 0;
        for lane in Lane::ALL {
            for (_, mut change) in self.drain(lane) {
                change.send_nack("change queue shut down");
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "Change queue stopped with pending changes");
        } else {
            info!("Change queue stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsync_types::{AckRecipient, LatencyTimer};
    use std::time::Duration;

    fn change(id: &str, revision: i64) -> ChangeMetadata {
        ChangeMetadata::new(id, revision)
    }

    #[test]
    fn test_enqueue_coalesces_per_thing() {
        let mut queue = ChangeQueue::new(ChangeQueueConfig::default());
        queue.enqueue(change("t1", 5));
        queue.enqueue(change("t1", 3));
        queue.enqueue(change("t2", 1));

        let batch = queue.drain(Lane::Default);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&ThingId::new("t1")].thing_revision, 5);
    }

    #[test]
    fn test_drain_hands_out_each_change_once() {
        let mut queue = ChangeQueue::new(ChangeQueueConfig::default());
        queue.enqueue(change("t1", 1));

        assert_eq!(queue.drain(Lane::Default).len(), 1);
        assert!(queue.drain(Lane::Default).is_empty());
    }

    #[test]
    fn test_ack_change_pulls_thing_into_ack_lane() {
        let mut queue = ChangeQueue::new(ChangeQueueConfig::default());
        let (recipient, _rx) = AckRecipient::channel("c1");

        queue.enqueue(change("t1", 1).invalidating_policy());
        queue.enqueue(change("t1", 2).with_ack_recipient(recipient));
        queue.enqueue(change("t1", 3));

        assert_eq!(
            queue.lengths(),
            QueueLengths {
                ack_required: 1,
                default: 0
            }
        );
        let batch = queue.drain(Lane::AckRequired);
        let merged = &batch[&ThingId::new("t1")];
        assert_eq!(merged.thing_revision, 3);
        assert!(merged.invalidate_policy);
        assert!(merged.requires_ack());
    }

    #[test]
    fn test_drained_thing_is_pending_again_in_its_own_lane() {
        let mut queue = ChangeQueue::new(ChangeQueueConfig::default());
        let (recipient, _rx) = AckRecipient::channel("c1");

        queue.enqueue(change("t1", 1).with_ack_recipient(recipient));
        let in_flight = queue.drain(Lane::AckRequired);
        assert_eq!(in_flight.len(), 1);

        queue.enqueue(change("t1", 2));
        assert_eq!(
            queue.lengths(),
            QueueLengths {
                ack_required: 0,
                default: 1
            }
        );
        let batch = queue.drain(Lane::Default);
        assert_eq!(batch[&ThingId::new("t1")].thing_revision, 2);
        assert!(!batch[&ThingId::new("t1")].requires_ack());
    }

    #[test]
    fn test_enqueue_starts_queued_segment() {
        let mut queue = ChangeQueue::new(ChangeQueueConfig::default());
        queue.enqueue(change("t1", 1).with_timer(LatencyTimer::start(false)));

        let batch = queue.drain(Lane::Default);
        let timer = &batch[&ThingId::new("t1")].timers()[0];
        assert_eq!(timer.current_segment(), Some(LatencySegment::Queued));
    }

    #[tokio::test]
    async fn test_actor_enqueue_and_drain() {
        let cancel = CancellationToken::new();
        let (handle, task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(cancel.clone());

        handle.enqueue(change("t1", 5)).await.unwrap();
        handle.enqueue(change("t1", 3)).await.unwrap();

        let batch = handle.drain(Lane::Default).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[&ThingId::new("t1")].thing_revision, 5);

        cancel.cancel();
        task.await.unwrap();
        assert!(handle.enqueue(change("t2", 1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_changes() {
        let cancel = CancellationToken::new();
        let (handle, _task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(cancel.clone());

        let drainer = handle.clone();
        let pending = tokio::spawn(async move { drainer.drain(Lane::AckRequired).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let (recipient, _rx) = AckRecipient::channel("c1");
        handle
            .enqueue(change("t1", 1).with_ack_recipient(recipient))
            .await
            .unwrap();

        let batch = pending.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_nacks_pending_changes() {
        let cancel = CancellationToken::new();
        let (handle, task) = ChangeQueue::new(ChangeQueueConfig::default()).spawn(cancel.clone());
        let (recipient, mut rx) = AckRecipient::channel("c1");

        handle
            .enqueue(change("t1", 1).with_ack_recipient(recipient))
            .await
            .unwrap();
        assert_eq!(handle.lengths().await.unwrap().ack_required, 1);

        cancel.cancel();
        task.await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert!(!ack.is_success());
    }
}
