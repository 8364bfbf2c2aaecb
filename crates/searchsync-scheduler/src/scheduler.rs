//! Stream scheduler service.
//!
//! Owns the supervisors of all registered sync types and manages their
//! lifecycle. Each supervisor runs in its own task under
//! [`StreamSupervisor::run_supervised`] with a child of the service's
//! shutdown token.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::{StreamHealth, StreamRegistry, StreamStatus};
use crate::supervisor::StreamSupervisor;
use crate::SchedulerError;

/// Service running one supervisor per sync type.
pub struct StreamScheduler {
    registry: Arc<StreamRegistry>,
    supervisors: Vec<Arc<StreamSupervisor>>,
    shutdown_token: CancellationToken,
    is_running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl StreamScheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(StreamRegistry::new()),
            supervisors: Vec::new(),
            shutdown_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// How long `shutdown` waits for supervisors before aborting them.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register a supervisor. It reports into this scheduler's registry.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::DuplicateStream` if the sync type is taken,
    /// `SchedulerError::AlreadyRunning` after `start`, or
    /// `SchedulerError::Config` if the stream config is invalid.
    pub fn add_stream(&mut self, supervisor: StreamSupervisor) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.registry.is_registered(supervisor.sync_type()) {
            return Err(SchedulerError::DuplicateStream(
                supervisor.sync_type().to_string(),
            ));
        }
        supervisor.config().validate()?;

        let supervisor = supervisor.with_registry(self.registry.clone());
        self.registry.register(supervisor.sync_type());
        info!(sync_type = %supervisor.sync_type(), "Stream registered");
        self.supervisors.push(Arc::new(supervisor));
        Ok(())
    }

    /// Spawn all supervisors.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the scheduler is already started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for supervisor in &self.supervisors {
            let supervisor = supervisor.clone();
            let token = self.shutdown_token.child_token();
            tasks.push(tokio::spawn(async move {
                supervisor.run_supervised(token).await;
            }));
        }
        info!(streams = self.supervisors.len(), "Scheduler started");
        Ok(())
    }

    /// Cancel all supervisors and wait for them to stop.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler is not started.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.shutdown_timeout, task).await.is_err() {
                warn!("Supervisor did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shutdown_token = CancellationToken::new();
        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    pub fn stream_count(&self) -> usize {
        self.supervisors.len()
    }

    /// Status and health of every stream, each judged by its own offsets.
    pub fn health(&self, now: DateTime<Utc>) -> Vec<(StreamStatus, StreamHealth)> {
        self.supervisors
            .iter()
            .filter_map(|supervisor| {
                let status = self.registry.get_status(supervisor.sync_type())?;
                let config = supervisor.config();
                let health = status.health(now, config.warn_offset, config.error_offset);
                Some((status, health))
            })
            .collect()
    }

    /// Sync types of all registered streams.
    pub fn sync_types(&self) -> HashSet<String> {
        self.supervisors
            .iter()
            .map(|s| s.sync_type().to_string())
            .collect()
    }
}

impl Default for StreamScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::forwarder::tests::{Reply, ReplyingRecipient, VecProvider};
    use crate::timestamp::{InMemoryTimestampStore, TimestampStore};

    fn supervisor(sync_type: &str, store: Arc<InMemoryTimestampStore>) -> StreamSupervisor {
        StreamSupervisor::new(
            sync_type,
            Arc::new(VecProvider::changes(&["a"])),
            Arc::new(ReplyingRecipient::new(Reply::Ack)),
            store,
        )
        .with_config(
            StreamConfig::default()
                .with_initial_start_offset(Duration::from_secs(3_600))
                .with_min_delay(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_scheduler_new() {
        let scheduler = StreamScheduler::new();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_start_stop() {
        let store = Arc::new(InMemoryTimestampStore::new());
        let mut scheduler = StreamScheduler::new();
        scheduler.add_stream(supervisor("background-sync", store.clone())).unwrap();

        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

        let token = scheduler.shutdown_token();
        scheduler.shutdown().await.unwrap();
        assert!(token.is_cancelled());
        assert!(!scheduler.is_running());
        assert!(matches!(
            scheduler.shutdown().await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let store = Arc::new(InMemoryTimestampStore::new());
        let mut scheduler = StreamScheduler::new();
        scheduler.add_stream(supervisor("catch-up", store.clone())).unwrap();

        let result = scheduler.add_stream(supervisor("catch-up", store));
        assert!(matches!(result, Err(SchedulerError::DuplicateStream(_))));
        assert_eq!(scheduler.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_stream_config_rejected() {
        let store = Arc::new(InMemoryTimestampStore::new());
        let mut scheduler = StreamScheduler::new();
        let bad = supervisor("s", store).with_config(StreamConfig::default().with_interval(Duration::ZERO));
        assert!(matches!(scheduler.add_stream(bad), Err(SchedulerError::Config(_))));
        assert!(!scheduler.registry().is_registered("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_run_and_report_health() {
        let store = Arc::new(InMemoryTimestampStore::new());
        let mut scheduler = StreamScheduler::new();
        scheduler.add_stream(supervisor("background-sync", store.clone())).unwrap();
        scheduler.add_stream(supervisor("catch-up", store.clone())).unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.shutdown().await.unwrap();

        assert!(store.get("background-sync").await.unwrap().is_some());
        assert!(store.get("catch-up").await.unwrap().is_some());

        let health = scheduler.health(Utc::now());
        assert_eq!(health.len(), 2);
        for (status, _) in &health {
            assert!(status.run_count >= 1);
            assert!(status.last_sync_point.is_some());
        }
        assert_eq!(
            scheduler.sync_types(),
            HashSet::from(["background-sync".to_string(), "catch-up".to_string()])
        );
    }
}
