//! Pending changes for a single thing.
//!
//! A [`ChangeMetadata`] is created for every observed mutation, coalesced with
//! other pending changes of the same thing in the change queue, and consumed
//! exactly once when its write model leaves the bulk write stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ack::{AckRecipient, AckStatus};
use crate::event::ThingEvent;
use crate::ids::{PolicyId, ThingId};
use crate::latency::{LatencySegment, LatencyTimer};

/// Change notification as delivered by protocol adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub thing_id: ThingId,
    pub revision: i64,
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
    #[serde(default)]
    pub policy_revision: Option<i64>,
    #[serde(default)]
    pub invalidate_thing: bool,
    #[serde(default)]
    pub invalidate_policy: bool,
    #[serde(default)]
    pub events: Vec<ThingEvent>,
    #[serde(default)]
    pub ack_requested: bool,
}

/// Pending change of one thing.
#[derive(Debug, Clone)]
pub struct ChangeMetadata {
    /// Thing this change belongs to
    pub thing_id: ThingId,
    /// Thing revision; the only authoritative ordering key
    pub thing_revision: i64,
    /// Policy governing the thing, if known
    pub policy_id: Option<PolicyId>,
    /// Policy revision, if known
    pub policy_revision: Option<i64>,
    /// Modification time of the thing, if known
    pub modified: Option<DateTime<Utc>>,
    /// Force a full fetch of the thing
    pub invalidate_thing: bool,
    /// Force a reload of the policy enforcer
    pub invalidate_policy: bool,
    /// Events that produced this revision; empty means "unknown diff"
    pub events: Vec<ThingEvent>,
    ack_recipients: Vec<AckRecipient>,
    timers: Vec<LatencyTimer>,
}

impl ChangeMetadata {
    /// Create metadata for a thing revision with no policy information.
    pub fn new(thing_id: impl Into<ThingId>, thing_revision: i64) -> Self {
        Self {
            thing_id: thing_id.into(),
            thing_revision,
            policy_id: None,
            policy_revision: None,
            modified: None,
            invalidate_thing: false,
            invalidate_policy: false,
            events: Vec::new(),
            ack_recipients: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Build metadata from an adapter notification, starting its latency timer.
    pub fn from_notification(
        notification: ChangeNotification,
        ack_recipient: Option<AckRecipient>,
    ) -> Self {
        let mut metadata = Self::new(notification.thing_id, notification.revision);
        metadata.policy_id = notification.policy_id;
        metadata.policy_revision = notification.policy_revision;
        metadata.invalidate_thing = notification.invalidate_thing;
        metadata.invalidate_policy = notification.invalidate_policy;
        metadata.events = notification.events;
        metadata.modified = metadata.events.last().map(|e| e.timestamp);
        metadata
            .timers
            .push(LatencyTimer::start(notification.ack_requested));
        if let Some(recipient) = ack_recipient {
            metadata.ack_recipients.push(recipient);
        }
        metadata
    }

    pub fn with_policy(mut self, policy_id: impl Into<PolicyId>, policy_revision: i64) -> Self {
        self.policy_id = Some(policy_id.into());
        self.policy_revision = Some(policy_revision);
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_events(mut self, events: Vec<ThingEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn invalidating_thing(mut self) -> Self {
        self.invalidate_thing = true;
        self
    }

    pub fn invalidating_policy(mut self) -> Self {
        self.invalidate_policy = true;
        self
    }

    /// Attach an acknowledgement callback. Duplicate callbacks are ignored.
    pub fn with_ack_recipient(mut self, recipient: AckRecipient) -> Self {
        if !self.ack_recipients.iter().any(|r| r.is_same(&recipient)) {
            self.ack_recipients.push(recipient);
        }
        self
    }

    pub fn with_timer(mut self, timer: LatencyTimer) -> Self {
        self.timers.push(timer);
        self
    }

    /// Whether any originator waits for an acknowledgement.
    pub fn requires_ack(&self) -> bool {
        !self.ack_recipients.is_empty()
    }

    pub fn ack_recipients(&self) -> &[AckRecipient] {
        &self.ack_recipients
    }

    pub fn timers(&self) -> &[LatencyTimer] {
        &self.timers
    }

    /// Coalesce two pending changes of the same thing.
    ///
    /// The result carries the identifying fields of the higher revision, the
    /// union of both invalidation flags, and the union of events, callbacks and
    /// timers. Merging is commutative and merging a change with itself is a no-op.
    pub fn merge(self, other: ChangeMetadata) -> ChangeMetadata {
        debug_assert_eq!(self.thing_id, other.thing_id);

        let (mut newer, older) = if other.thing_revision >= self.thing_revision {
            (other, self)
        } else {
            (self, other)
        };

        newer.invalidate_thing |= older.invalidate_thing;
        newer.invalidate_policy |= older.invalidate_policy;

        if newer.policy_id.is_none() {
            newer.policy_id = older.policy_id;
            newer.policy_revision = older.policy_revision;
        } else if newer.policy_id == older.policy_id {
            newer.policy_revision = newer.policy_revision.max(older.policy_revision);
        }
        newer.modified = newer.modified.max(older.modified);

        for event in older.events {
            if !newer.events.iter().any(|e| e.revision == event.revision) {
                newer.events.push(event);
            }
        }
        newer.events.sort_by_key(|e| e.revision);

        for recipient in older.ack_recipients {
            if !newer.ack_recipients.iter().any(|r| r.is_same(&recipient)) {
                newer.ack_recipients.push(recipient);
            }
        }
        for timer in older.timers {
            if !newer.timers.iter().any(|t| t.id() == timer.id()) {
                newer.timers.push(timer);
            }
        }

        newer
    }

    /// Advance every attached timer to `segment`.
    pub fn start_segment(&mut self, segment: LatencySegment) {
        for timer in &mut self.timers {
            timer.start_segment(segment);
        }
    }

    /// Stop every attached timer.
    pub fn stop_timers(&mut self) {
        for timer in &mut self.timers {
            timer.stop();
        }
    }

    /// Acknowledge success to every waiting originator.
    ///
    /// Idempotent: recipients are consumed by the first call. Timers are
    /// stopped even when nobody waits for an acknowledgement.
    pub fn send_ack(&mut self) -> usize {
        self.resolve(AckStatus::Success)
    }

    /// Acknowledge failure to every waiting originator. Idempotent like [`Self::send_ack`].
    pub fn send_nack(&mut self, reason: impl Into<String>) -> usize {
        self.resolve(AckStatus::Failure(reason.into()))
    }

    /// Whether all callbacks were resolved and all timers stopped.
    pub fn is_resolved(&self) -> bool {
        self.ack_recipients.is_empty() && self.timers.iter().all(|t| t.is_stopped())
    }

    /// Turn this change into one that forces a full fetch on the next cycle.
    ///
    /// Callbacks and timers are carried over so they are resolved by the retry.
    pub fn into_full_retry(mut self) -> Self {
        self.invalidate_thing = true;
        self.events.clear();
        self
    }

    fn resolve(&mut self, status: AckStatus) -> usize {
        self.start_segment(LatencySegment::Acknowledge);
        let mut delivered = 0;
        for recipient in self.ack_recipients.drain(..) {
            if recipient.send(&self.thing_id, self.thing_revision, status.clone()) {
                delivered += 1;
            }
        }
        self.stop_timers();
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ThingEventKind;

    fn event(revision: i64) -> ThingEvent {
        ThingEvent::new(revision, ThingEventKind::Modified, "/attributes/a")
    }

    #[test]
    fn test_merge_keeps_higher_revision() {
        let five = ChangeMetadata::new("ns:t", 5).with_policy("ns:p", 2);
        let three = ChangeMetadata::new("ns:t", 3).with_policy("ns:p", 1);

        let merged = five.clone().merge(three.clone());
        assert_eq!(merged.thing_revision, 5);
        assert_eq!(merged.policy_revision, Some(2));

        let merged = three.merge(five);
        assert_eq!(merged.thing_revision, 5);
        assert_eq!(merged.policy_revision, Some(2));
    }

    #[test]
    fn test_merge_unions_flags() {
        let a = ChangeMetadata::new("t", 1).invalidating_thing();
        let b = ChangeMetadata::new("t", 2).invalidating_policy();

        let merged = a.merge(b);
        assert!(merged.invalidate_thing);
        assert!(merged.invalidate_policy);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (recipient, _rx) = AckRecipient::channel("c1");
        let change = ChangeMetadata::new("t", 4)
            .with_events(vec![event(4)])
            .with_ack_recipient(recipient)
            .with_timer(LatencyTimer::start(true))
            .invalidating_policy();

        let merged = change.clone().merge(change.clone());
        assert_eq!(merged.thing_revision, 4);
        assert!(merged.invalidate_policy);
        assert!(!merged.invalidate_thing);
        assert_eq!(merged.ack_recipients().len(), 1);
        assert_eq!(merged.timers().len(), 1);
        assert_eq!(merged.events.len(), 1);
    }

    #[test]
    fn test_merge_never_drops_callbacks() {
        let (r1, _rx1) = AckRecipient::channel("c1");
        let (r2, _rx2) = AckRecipient::channel("c2");
        let a = ChangeMetadata::new("t", 1).with_ack_recipient(r1);
        let b = ChangeMetadata::new("t", 2).with_ack_recipient(r2);

        let merged = a.merge(b);
        assert_eq!(merged.ack_recipients().len(), 2);
    }

    #[test]
    fn test_merge_sorts_and_dedups_events() {
        let a = ChangeMetadata::new("t", 4).with_events(vec![event(3), event(4)]);
        let b = ChangeMetadata::new("t", 5).with_events(vec![event(4), event(5)]);

        let merged = a.merge(b);
        let revisions: Vec<_> = merged.events.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![3, 4, 5]);
    }

    #[test]
    fn test_merge_inherits_policy_when_unknown() {
        let known = ChangeMetadata::new("t", 1).with_policy("p", 3);
        let unknown = ChangeMetadata::new("t", 2);

        let merged = known.merge(unknown);
        assert_eq!(merged.thing_revision, 2);
        assert_eq!(merged.policy_id, Some(PolicyId::new("p")));
        assert_eq!(merged.policy_revision, Some(3));
    }

    #[test]
    fn test_ack_is_idempotent_and_stops_timers() {
        let (recipient, mut rx) = AckRecipient::channel("c1");
        let mut change = ChangeMetadata::new("t", 1)
            .with_ack_recipient(recipient)
            .with_timer(LatencyTimer::start(true));

        assert_eq!(change.send_ack(), 1);
        assert_eq!(change.send_nack("late"), 0);
        assert!(change.is_resolved());

        let ack = rx.try_recv().unwrap();
        assert!(ack.is_success());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_nack_without_recipients_still_stops_timers() {
        let mut change = ChangeMetadata::new("t", 1).with_timer(LatencyTimer::start(false));
        assert_eq!(change.send_nack("write failed"), 0);
        assert!(change.is_resolved());
    }

    #[test]
    fn test_from_notification() {
        let notification: ChangeNotification = serde_json::from_value(serde_json::json!({
            "thing_id": "ns:t1",
            "revision": 9,
            "policy_id": "ns:p1",
            "policy_revision": 2,
            "ack_requested": true
        }))
        .unwrap();
        let (recipient, _rx) = AckRecipient::channel("c1");

        let change = ChangeMetadata::from_notification(notification, Some(recipient));
        assert_eq!(change.thing_id, ThingId::new("ns:t1"));
        assert_eq!(change.thing_revision, 9);
        assert!(change.requires_ack());
        assert_eq!(change.timers().len(), 1);
        assert!(change.timers()[0].ack_required());
        assert!(change.events.is_empty());
    }

    #[test]
    fn test_into_full_retry_keeps_callbacks() {
        let (recipient, _rx) = AckRecipient::channel("c1");
        let change = ChangeMetadata::new("t", 3)
            .with_events(vec![event(3)])
            .with_ack_recipient(recipient)
            .into_full_retry();

        assert!(change.invalidate_thing);
        assert!(change.events.is_empty());
        assert!(change.requires_ack());
    }
}
