//! Stream triggers.
//!
//! A trigger is one scheduled execution of a periodic stream: the query
//! window `[query_start, query_end)` over modification time and the instant
//! the stream should start. Windows always have the configured width and a
//! stream never starts before its window has closed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{chrono_duration, StreamConfig};

/// One scheduled stream execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTrigger {
    pub query_start: DateTime<Utc>,
    pub query_end: DateTime<Utc>,
    pub planned_stream_start: DateTime<Utc>,
}

impl StreamTrigger {
    /// Trigger of the window starting at the last persisted sync point.
    ///
    /// The stream starts `start_offset` after the window closed, but never
    /// sooner than `min_delay` from now.
    pub fn next(last_success: DateTime<Utc>, config: &StreamConfig, now: DateTime<Utc>) -> Self {
        let query_start = last_success;
        let query_end = query_start + chrono_duration(config.interval);
        let planned_stream_start = (query_end + chrono_duration(config.start_offset))
            .max(now + chrono_duration(config.min_delay));
        Self {
            query_start,
            query_end,
            planned_stream_start,
        }
    }

    /// First trigger after startup. Without a persisted sync point the first
    /// window starts `initial_start_offset` in the past.
    pub fn initial(
        persisted: Option<DateTime<Utc>>,
        config: &StreamConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let last_success =
            persisted.unwrap_or_else(|| now - chrono_duration(config.initial_start_offset));
        Self::next(last_success, config, now)
    }

    /// Same window, started one interval from now.
    pub fn rescheduled(&self, config: &StreamConfig, now: DateTime<Utc>) -> Self {
        Self {
            planned_stream_start: (now + chrono_duration(config.interval)).max(self.query_end),
            ..*self
        }
    }

    /// Time left until the planned start, zero if it already passed.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        self.planned_stream_start
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for StreamTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}) at {}",
            self.query_start.to_rfc3339(),
            self.query_end.to_rfc3339(),
            self.planned_stream_start.to_rfc3339()
        )
    }
}
