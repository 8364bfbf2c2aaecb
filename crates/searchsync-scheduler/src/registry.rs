//! Stream status registry.
//!
//! The `StreamRegistry` tracks every supervised stream: run and failure
//! counts, the last persisted sync point and the next planned start. Health
//! is derived from how far the sync point lags behind the clock.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::chrono_duration;

/// Result of one stream run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamResult {
    Success,
    /// Stream or a forwarded change failed
    Failed(String),
    /// Forwarder gave up waiting for activity
    TimedOut,
}

/// Health of a stream, based on the age of its sync point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamHealth {
    Up,
    Warning,
    Down,
}

impl std::fmt::Display for StreamHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamHealth::Up => "UP",
            StreamHealth::Warning => "WARNING",
            StreamHealth::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// Status of a supervised stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub sync_type: String,
    pub run_count: u64,
    pub failure_count: u64,
    /// Times the supervisor was restarted after getting stuck or failing
    pub restart_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<StreamResult>,
    /// End of the last acknowledged window
    pub last_sync_point: Option<DateTime<Utc>>,
    pub next_planned_start: Option<DateTime<Utc>>,
    /// Whether a forwarder is currently running
    pub is_active: bool,
}

impl StreamStatus {
    pub fn new(sync_type: String) -> Self {
        Self {
            sync_type,
            run_count: 0,
            failure_count: 0,
            restart_count: 0,
            last_run: None,
            last_result: None,
            last_sync_point: None,
            next_planned_start: None,
            is_active: false,
        }
    }

    /// `Down` if the sync point is older than `error_offset` or unknown,
    /// `Warning` if older than `warn_offset`, `Up` otherwise.
    pub fn health(
        &self,
        now: DateTime<Utc>,
        warn_offset: Duration,
        error_offset: Duration,
    ) -> StreamHealth {
        let Some(sync_point) = self.last_sync_point else {
            return StreamHealth::Down;
        };
        let lag = now - sync_point;
        if lag > chrono_duration(error_offset) {
            StreamHealth::Down
        } else if lag > chrono_duration(warn_offset) {
            StreamHealth::Warning
        } else {
            StreamHealth::Up
        }
    }
}

/// Thread-safe registry of stream statuses.
///
/// ```
/// use searchsync_scheduler::{StreamRegistry, StreamResult};
///
/// let registry = StreamRegistry::new();
/// registry.register("background-sync");
///
/// registry.record_start("background-sync");
/// assert!(registry.is_active("background-sync"));
///
/// registry.record_complete("background-sync", StreamResult::Success, None);
/// assert!(!registry.is_active("background-sync"));
/// ```
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, StreamStatus>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Register a stream. Replaces an existing entry of the same sync type.
    pub fn register(&self, sync_type: &str) {
        self.write()
            .insert(sync_type.to_string(), StreamStatus::new(sync_type.to_string()));
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StreamStatus>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StreamStatus>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, sync_type: &str, f: impl FnOnce(&mut StreamStatus)) {
        if let Some(status) = self.write().get_mut(sync_type) {
            f(status);
        }
    }

    pub fn record_start(&self, sync_type: &str) {
        self.update(sync_type, |status| {
            status.is_active = true;
            status.last_run = Some(Utc::now());
        });
    }

    /// Record the end of a run. A successful run advances the sync point
    /// when `sync_point` is given.
    pub fn record_complete(
        &self,
        sync_type: &str,
        result: StreamResult,
        sync_point: Option<DateTime<Utc>>,
    ) {
        self.update(sync_type, |status| {
            status.is_active = false;
            status.run_count += 1;
            if result != StreamResult::Success {
                status.failure_count += 1;
            } else if let Some(sync_point) = sync_point {
                status.last_sync_point = Some(sync_point);
            }
            status.last_result = Some(result);
        });
    }

    pub fn set_sync_point(&self, sync_type: &str, sync_point: DateTime<Utc>) {
        self.update(sync_type, |status| status.last_sync_point = Some(sync_point));
    }

    pub fn set_next_planned_start(&self, sync_type: &str, next: DateTime<Utc>) {
        self.update(sync_type, |status| status.next_planned_start = Some(next));
    }

    pub fn record_restart(&self, sync_type: &str) {
        self.update(sync_type, |status| {
            status.restart_count += 1;
            status.is_active = false;
        });
    }

    pub fn get_status(&self, sync_type: &str) -> Option<StreamStatus> {
        self.read().get(sync_type).cloned()
    }

    /// All statuses, ordered by sync type.
    pub fn get_all_status(&self) -> Vec<StreamStatus> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.sync_type.cmp(&b.sync_type));
        all
    }

    pub fn is_active(&self, sync_type: &str) -> bool {
        self.read()
            .get(sync_type)
            .map(|s| s.is_active)
            .unwrap_or(false)
    }

    pub fn is_registered(&self, sync_type: &str) -> bool {
        self.read().contains_key(sync_type)
    }

    pub fn stream_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_get() {
        let registry = StreamRegistry::new();
        registry.register("background-sync");

        let status = registry.get_status("background-sync").unwrap();
        assert_eq!(status.sync_type, "background-sync");
        assert_eq!(status.run_count, 0);
        assert!(!status.is_active);
        assert!(status.last_sync_point.is_none());
    }

    #[test]
    fn test_registry_success_advances_sync_point() {
        let registry = StreamRegistry::new();
        registry.register("catch-up");
        registry.record_start("catch-up");
        assert!(registry.is_active("catch-up"));

        let point = Utc::now();
        registry.record_complete("catch-up", StreamResult::Success, Some(point));

        let status = registry.get_status("catch-up").unwrap();
        assert!(!status.is_active);
        assert!(status.last_run.is_some());
        assert_eq!(status.run_count, 1);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.last_sync_point, Some(point));
        assert_eq!(status.last_result, Some(StreamResult::Success));
    }

    #[test]
    fn test_registry_failure_keeps_sync_point() {
        let registry = StreamRegistry::new();
        registry.register("catch-up");
        let point = Utc::now();
        registry.set_sync_point("catch-up", point);

        registry.record_complete(
            "catch-up",
            StreamResult::Failed("nack".into()),
            Some(point + chrono::Duration::seconds(300)),
        );
        registry.record_complete("catch-up", StreamResult::TimedOut, None);

        let status = registry.get_status("catch-up").unwrap();
        assert_eq!(status.run_count, 2);
        assert_eq!(status.failure_count, 2);
        assert_eq!(status.last_sync_point, Some(point));
        assert_eq!(status.last_result, Some(StreamResult::TimedOut));
    }

    #[test]
    fn test_health_thresholds() {
        let now = Utc::now();
        let warn = Duration::from_secs(1800);
        let error = Duration::from_secs(3600);
        let mut status = StreamStatus::new("s".into());

        assert_eq!(status.health(now, warn, error), StreamHealth::Down);

        status.last_sync_point = Some(now - chrono::Duration::seconds(60));
        assert_eq!(status.health(now, warn, error), StreamHealth::Up);

        status.last_sync_point = Some(now - chrono::Duration::seconds(2000));
        assert_eq!(status.health(now, warn, error), StreamHealth::Warning);

        status.last_sync_point = Some(now - chrono::Duration::seconds(4000));
        assert_eq!(status.health(now, warn, error), StreamHealth::Down);
    }

    #[test]
    fn test_registry_restart_and_next_start() {
        let registry = StreamRegistry::new();
        registry.register("s");
        registry.record_start("s");
        registry.record_restart("s");

        let next = Utc::now();
        registry.set_next_planned_start("s", next);

        let status = registry.get_status("s").unwrap();
        assert_eq!(status.restart_count, 1);
        assert!(!status.is_active);
        assert_eq!(status.next_planned_start, Some(next));
    }

    #[test]
    fn test_registry_unknown_stream() {
        let registry = StreamRegistry::new();
        assert!(registry.get_status("unknown").is_none());
        assert!(!registry.is_active("unknown"));
        assert!(!registry.is_registered("unknown"));

        registry.record_start("unknown");
        registry.record_complete("unknown", StreamResult::Success, None);
        registry.record_restart("unknown");
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_get_all_status_sorted() {
        let registry = StreamRegistry::new();
        registry.register("catch-up");
        registry.register("background-sync");

        let names: Vec<_> = registry
            .get_all_status()
            .into_iter()
            .map(|s| s.sync_type)
            .collect();
        assert_eq!(names, vec!["background-sync", "catch-up"]);
    }

    #[test]
    fn test_status_serializes() {
        let mut status = StreamStatus::new("catch-up".into());
        status.last_result = Some(StreamResult::Failed("nack".into()));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["sync_type"], "catch-up");
        assert_eq!(json["last_result"]["Failed"], "nack");
        assert!(json["last_sync_point"].is_null());
    }

    #[test]
    fn test_health_display() {
        assert_eq!(StreamHealth::Up.to_string(), "UP");
        assert_eq!(StreamHealth::Down.to_string(), "DOWN");
    }
}
