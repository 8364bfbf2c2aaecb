//! Per-thing metadata compared by background sync.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PolicyId, ThingId};

/// Revision and policy information of one thing, as recorded by either the
/// authoritative store or the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub thing_id: ThingId,
    pub thing_revision: i64,
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
    #[serde(default)]
    pub policy_revision: Option<i64>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub modified: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    pub fn new(thing_id: impl Into<ThingId>, thing_revision: i64) -> Self {
        Self {
            thing_id: thing_id.into(),
            thing_revision,
            policy_id: None,
            policy_revision: None,
            modified: None,
        }
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

    /// Placeholder paired with keys that only exist on one side of a merge.
    pub fn sentinel() -> Self {
        Self::new(ThingId::sentinel(), 0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.thing_id.is_sentinel()
    }

    /// Total order by thing id; the sentinel sorts before everything.
    pub fn compare_ids(&self, other: &SyncMetadata) -> Ordering {
        self.thing_id.cmp(&other.thing_id)
    }
}
