//! Stream supervision configuration.
//!
//! Runtime view of [`StreamSettings`] with durations instead of raw seconds.

use std::time::Duration;

use searchsync_types::StreamSettings;

use crate::SchedulerError;

/// Configuration of one stream supervisor.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Width of one query window
    pub interval: Duration,
    /// Delay after a window closes before it is streamed
    pub start_offset: Duration,
    /// How far back the first window starts when nothing was persisted
    pub initial_start_offset: Duration,
    pub warn_offset: Duration,
    pub error_offset: Duration,
    /// Forwarder gives up after this long without activity
    pub idle_timeout: Duration,
    /// Minimal delay between two streams
    pub min_delay: Duration,
    pub self_check_interval: Duration,
    /// Supervisor counts as stuck if no forwarder started or stopped for this long
    pub stuck_after: Duration,
    /// Back-off before a stuck supervisor is restarted
    pub restart_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}

impl StreamConfig {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            start_offset: Duration::from_secs(settings.start_offset_secs),
            initial_start_offset: Duration::from_secs(settings.initial_start_offset_secs),
            warn_offset: Duration::from_secs(settings.warn_offset_secs),
            error_offset: Duration::from_secs(settings.error_offset_secs),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            min_delay: Duration::from_secs(settings.min_delay_secs),
            self_check_interval: Duration::from_secs(settings.self_check_interval_secs),
            stuck_after: Duration::from_secs(settings.stuck_after_secs),
            restart_backoff: Duration::from_secs(settings.restart_backoff_secs),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_initial_start_offset(mut self, offset: Duration) -> Self {
        self.initial_start_offset = offset;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_self_check(mut self, interval: Duration, stuck_after: Duration) -> Self {
        self.self_check_interval = interval;
        self.stuck_after = stuck_after;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Check the invariants the supervisor relies on.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` if the interval, idle timeout or
    /// self-check interval is zero, or if offsets are inconsistent.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.interval.is_zero() {
            return Err(SchedulerError::Config("interval must be > 0".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(SchedulerError::Config("idle timeout must be > 0".to_string()));
        }
        if self.self_check_interval.is_zero() {
            return Err(SchedulerError::Config(
                "self-check interval must be > 0".to_string(),
            ));
        }
        if self.error_offset < self.warn_offset {
            return Err(SchedulerError::Config(
                "error offset must not be below warn offset".to_string(),
            ));
        }
        Ok(())
    }
}

/// Convert to a chrono duration, saturating at 100 years.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
