//! Thing events carried by change notifications.
//!
//! Events describe the concrete modification that produced a revision.
//! The pipeline never interprets event payloads itself; it hands them to
//! the enrichment facade so the facade can apply them to a cached copy of
//! the thing instead of fetching it in full.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of modification an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThingEventKind {
    /// Thing was created
    Created,
    /// Value at `path` was replaced
    Modified,
    /// Value at `path` was merged into the existing value
    Merged,
    /// Value at `path` was removed (empty path: thing was deleted)
    Deleted,
}

impl std::fmt::Display for ThingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThingEventKind::Created => write!(f, "created"),
            ThingEventKind::Modified => write!(f, "modified"),
            ThingEventKind::Merged => write!(f, "merged"),
            ThingEventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One modification of a thing at a specific revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingEvent {
    /// Revision of the thing after this event was applied
    pub revision: i64,

    /// What kind of modification happened
    pub kind: ThingEventKind,

    /// JSON pointer of the modified value ("" for the whole thing)
    #[serde(default)]
    pub path: String,

    /// New value at `path`, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// When the modification happened (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ThingEvent {
    /// Create a new event at the current time.
    pub fn new(revision: i64, kind: ThingEventKind, path: impl Into<String>) -> Self {
        Self {
            revision,
            kind,
            path: path.into(),
            value: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the new value.
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Whether this event created the thing.
    pub fn is_creation(&self) -> bool {
        self.kind == ThingEventKind::Created
    }

    /// Whether this event deleted the whole thing.
    pub fn is_thing_deletion(&self) -> bool {
        self.kind == ThingEventKind::Deleted && self.path.is_empty()
    }
}

/// Check whether events form an unbroken revision sequence ending at `target_revision`.
///
/// Incremental enrichment is only possible when no revision in between is missing.
pub fn is_contiguous(events: &[ThingEvent], target_revision: i64) -> bool {
    let Some(last) = events.last() else {
        return false;
    };
    if last.revision != target_revision {
        return false;
    }
    events
        .windows(2)
        .all(|pair| pair[1].revision == pair[0].revision + 1)
}
