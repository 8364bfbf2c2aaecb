//! Stream supervisor.
//!
//! One supervisor per sync type. It computes triggers from the persisted sync
//! timestamp, starts at most one forwarder at a time and advances the
//! timestamp only after a forwarder completed. A failed or idle forwarder
//! leaves the timestamp untouched and its window is retried later.
//!
//! The supervisor checks itself periodically. If no forwarder started or
//! stopped for `stuck_after`, [`StreamSupervisor::run`] fails with
//! [`SchedulerError::Stuck`] and [`StreamSupervisor::run_supervised`] starts
//! it again from scratch.

use std::future::pending;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use searchsync_storage::StreamRunRecord;

use crate::config::StreamConfig;
use crate::forwarder::{Forwarder, ForwarderOutcome, StreamProvider, StreamRecipient};
use crate::registry::{StreamRegistry, StreamResult};
use crate::timestamp::TimestampStore;
use crate::trigger::StreamTrigger;
use crate::SchedulerError;

/// Forwarder task owned by a supervisor. Dropping it stops the task.
struct ActiveForwarder {
    trigger: StreamTrigger,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<ForwarderOutcome>,
}

impl Drop for ActiveForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

async fn join_active(active: &mut Option<ActiveForwarder>) -> Result<ForwarderOutcome, JoinError> {
    match active {
        Some(forwarder) => (&mut forwarder.handle).await,
        None => pending().await,
    }
}

/// Supervises the periodic stream of one sync type.
pub struct StreamSupervisor {
    sync_type: String,
    provider: Arc<dyn StreamProvider>,
    recipient: Arc<dyn StreamRecipient>,
    store: Arc<dyn TimestampStore>,
    registry: Arc<StreamRegistry>,
    config: StreamConfig,
}

impl StreamSupervisor {
    pub fn new(
        sync_type: impl Into<String>,
        provider: Arc<dyn StreamProvider>,
        recipient: Arc<dyn StreamRecipient>,
        store: Arc<dyn TimestampStore>,
    ) -> Self {
        Self {
            sync_type: sync_type.into(),
            provider,
            recipient,
            store,
            registry: Arc::new(StreamRegistry::new()),
            config: StreamConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<StreamRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn sync_type(&self) -> &str {
        &self.sync_type
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    /// Supervise until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Stuck` when the self-check finds no forwarder
    /// activity for `stuck_after`, or a storage error if the sync timestamp
    /// cannot be read or written.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        self.config.validate()?;
        if !self.registry.is_registered(&self.sync_type) {
            self.registry.register(&self.sync_type);
        }

        let persisted = self.store.get(&self.sync_type).await?;
        let mut trigger = StreamTrigger::initial(persisted, &self.config, Utc::now());
        self.registry.set_sync_point(&self.sync_type, trigger.query_start);
        self.plan(&trigger);

        let mut active: Option<ActiveForwarder> = None;
        let mut last_activity = Instant::now();

        let timer = tokio::time::sleep(trigger.delay_from(Utc::now()));
        tokio::pin!(timer);

        let mut self_check = tokio::time::interval_at(
            Instant::now() + self.config.self_check_interval,
            self.config.self_check_interval,
        );
        self_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(sync_type = %self.sync_type, "Supervisor cancelled");
                    return Ok(());
                }

                _ = &mut timer => {
                    let now = Utc::now();
                    if let Some(forwarder) = &active {
                        trigger = forwarder.trigger.rescheduled(&self.config, now);
                        info!(
                            sync_type = %self.sync_type,
                            trigger = %trigger,
                            "Forwarder still active, rescheduling"
                        );
                        self.plan(&trigger);
                        timer.as_mut().reset(Instant::now() + trigger.delay_from(now));
                    } else {
                        active = Some(self.spawn_forwarder(trigger, &cancel));
                        last_activity = Instant::now();
                        timer.as_mut().reset(Instant::now() + self.config.interval);
                    }
                }

                result = join_active(&mut active) => {
                    let finished = active.take();
                    last_activity = Instant::now();
                    let now = Utc::now();
                    let Some(forwarder) = finished else {
                        continue;
                    };

                    trigger = match result {
                        Ok(ForwarderOutcome::Completed { forwarded }) => {
                            self.store.set(&self.sync_type, forwarder.trigger.query_end).await?;
                            info!(
                                sync_type = %self.sync_type,
                                forwarded,
                                sync_point = %forwarder.trigger.query_end.to_rfc3339(),
                                "Stream completed"
                            );
                            self.finish(&forwarder, StreamResult::Success, None).await;
                            StreamTrigger::next(forwarder.trigger.query_end, &self.config, now)
                        }
                        Ok(ForwarderOutcome::Failed(reason)) => {
                            warn!(sync_type = %self.sync_type, reason = %reason, "Stream failed");
                            self.finish(&forwarder, StreamResult::Failed(reason.clone()), Some(reason))
                                .await;
                            forwarder.trigger.rescheduled(&self.config, now)
                        }
                        Ok(ForwarderOutcome::IdleTimeout { pending }) => {
                            warn!(sync_type = %self.sync_type, pending, "Stream timed out");
                            self.finish(
                                &forwarder,
                                StreamResult::TimedOut,
                                Some(format!("idle timeout with {pending} pending")),
                            )
                            .await;
                            forwarder.trigger.rescheduled(&self.config, now)
                        }
                        Err(e) => {
                            warn!(sync_type = %self.sync_type, error = %e, "Forwarder task failed");
                            self.finish(&forwarder, StreamResult::Failed(e.to_string()), Some(e.to_string()))
                                .await;
                            forwarder.trigger.rescheduled(&self.config, now)
                        }
                    };
                    self.plan(&trigger);
                    timer.as_mut().reset(Instant::now() + trigger.delay_from(now));
                }

                _ = self_check.tick() => {
                    let idle = last_activity.elapsed();
                    if idle > self.config.stuck_after {
                        error!(
                            sync_type = %self.sync_type,
                            idle_secs = idle.as_secs(),
                            active = active.is_some(),
                            "Supervisor stuck"
                        );
                        return Err(SchedulerError::Stuck {
                            sync_type: self.sync_type.clone(),
                            idle_secs: idle.as_secs(),
                        });
                    }
                }
            }
        }
    }

    /// Run the supervisor, restarting it with fresh state after every failure
    /// until `cancel` fires.
    pub async fn run_supervised(&self, cancel: CancellationToken) {
        loop {
            let child = cancel.child_token();
            let result = self.run(child.clone()).await;
            child.cancel();

            match result {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        sync_type = %self.sync_type,
                        error = %e,
                        backoff_secs = self.config.restart_backoff.as_secs(),
                        "Supervisor failed, restarting"
                    );
                    self.registry.record_restart(&self.sync_type);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }
        }
    }

    fn spawn_forwarder(&self, trigger: StreamTrigger, cancel: &CancellationToken) -> ActiveForwarder {
        let token = cancel.child_token();
        let forwarder = Forwarder::new(
            self.sync_type.clone(),
            self.provider.clone(),
            self.recipient.clone(),
            self.config.idle_timeout,
        );
        let handle = tokio::spawn(forwarder.run(trigger, token.clone()));
        self.registry.record_start(&self.sync_type);
        info!(sync_type = %self.sync_type, trigger = %trigger, "Forwarder spawned");

        ActiveForwarder {
            trigger,
            started_at: Utc::now(),
            cancel: token,
            handle,
        }
    }

    fn plan(&self, trigger: &StreamTrigger) {
        self.registry
            .set_next_planned_start(&self.sync_type, trigger.planned_stream_start);
    }

    async fn finish(&self, forwarder: &ActiveForwarder, result: StreamResult, message: Option<String>) {
        let success = result == StreamResult::Success;
        let sync_point = success.then_some(forwarder.trigger.query_end);
        self.registry.record_complete(&self.sync_type, result, sync_point);

        let record = StreamRunRecord {
            window_start: forwarder.trigger.query_start,
            window_end: forwarder.trigger.query_end,
            started_at: forwarder.started_at,
            finished_at: Utc::now(),
            success,
            message,
        };
        if let Err(e) = self.store.record_run(&self.sync_type, &record).await {
            warn!(sync_type = %self.sync_type, error = %e, "Failed to record stream run");
        }
    }
}
