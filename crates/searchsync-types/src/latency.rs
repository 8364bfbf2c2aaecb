//! Latency timers following a change through the updater.
//!
//! A timer is started when a change notification enters the updater and is
//! advanced through named segments until the change is acknowledged.
//! Stopped timers are emitted as tracing events on the
//! `searchsync::latency` target; exporting them to a metrics backend is left
//! to the subscriber.

use std::time::{Duration, Instant};

use ulid::Ulid;

/// Named segment of the updater latency timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencySegment {
    /// Between arrival and enqueue
    InUpdater,
    /// Waiting in the change queue
    Queued,
    /// Fetching the thing from the enrichment facade
    RetrieveThing,
    /// Resolving the policy enforcer
    GetEnforcer,
    /// Building the write model
    ToWriteModel,
    /// Waiting for the bulk write
    BulkWrite,
    /// Sending acknowledgements
    Acknowledge,
}

impl LatencySegment {
    /// Metric-style segment name.
    pub fn name(&self) -> &'static str {
        match self {
            LatencySegment::InUpdater => "s0_in_updater",
            LatencySegment::Queued => "s1_queued",
            LatencySegment::RetrieveThing => "s2_retrieve_thing",
            LatencySegment::GetEnforcer => "s3_get_enforcer",
            LatencySegment::ToWriteModel => "s4_to_write_model",
            LatencySegment::BulkWrite => "s5_bulk_write",
            LatencySegment::Acknowledge => "s6_acknowledge",
        }
    }
}

impl std::fmt::Display for LatencySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Segmented latency timer for one change notification.
#[derive(Debug, Clone)]
pub struct LatencyTimer {
    id: Ulid,
    ack_required: bool,
    started_at: Instant,
    current: Option<(LatencySegment, Instant)>,
    completed: Vec<(LatencySegment, Duration)>,
    stopped: bool,
}

impl LatencyTimer {
    /// Start a timer in the `s0_in_updater` segment.
    pub fn start(ack_required: bool) -> Self {
        let now = Instant::now();
        Self {
            id: Ulid::new(),
            ack_required,
            started_at: now,
            current: Some((LatencySegment::InUpdater, now)),
            completed: Vec::new(),
            stopped: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn ack_required(&self) -> bool {
        self.ack_required
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The segment currently being timed.
    pub fn current_segment(&self) -> Option<LatencySegment> {
        self.current.map(|(segment, _)| segment)
    }

    /// Segments finished so far, in order.
    pub fn completed_segments(&self) -> &[(LatencySegment, Duration)] {
        &self.completed
    }

    /// Close the running segment and start `segment`. No-op once stopped.
    pub fn start_segment(&mut self, segment: LatencySegment) {
        if self.stopped {
            return;
        }
        let now = Instant::now();
        self.close_current(now);
        self.current = Some((segment, now));
    }

    /// Stop the timer and emit it. Stopping twice emits once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.close_current(Instant::now());
        self.stopped = true;

        let segments: Vec<String> = self
            .completed
            .iter()
            .map(|(segment, elapsed)| format!("{}={}ms", segment, elapsed.as_millis()))
            .collect();
        tracing::debug!(
            target: "searchsync::latency",
            timer = %self.id,
            ack_required = self.ack_required,
            total_ms = self.started_at.elapsed().as_millis() as u64,
            segments = %segments.join(","),
            "updater latency"
        );
    }

    fn close_current(&mut self, now: Instant) {
        if let Some((segment, since)) = self.current.take() {
            self.completed.push((segment, now.saturating_duration_since(since)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_advance_in_order() {
        let mut timer = LatencyTimer::start(true);
        assert_eq!(timer.current_segment(), Some(LatencySegment::InUpdater));

        timer.start_segment(LatencySegment::Queued);
        timer.start_segment(LatencySegment::RetrieveThing);
        timer.stop();

        let names: Vec<_> = timer
            .completed_segments()
            .iter()
            .map(|(s, _)| s.name())
            .collect();
        assert_eq!(names, vec!["s0_in_updater", "s1_queued", "s2_retrieve_thing"]);
        assert!(timer.is_stopped());
        assert!(timer.ack_required());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut timer = LatencyTimer::start(false);
        timer.stop();
        timer.stop();
        timer.start_segment(LatencySegment::BulkWrite);

        assert_eq!(timer.completed_segments().len(), 1);
        assert_eq!(timer.current_segment(), None);
    }
}
