//! Search documents and the write models that persist them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::ChangeMetadata;
use crate::ids::{PolicyId, ThingId};
use crate::sync::SyncMetadata;

/// One indexed leaf value together with the subjects allowed to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// JSON pointer of the leaf
    pub path: String,
    pub value: serde_json::Value,
    pub readers: BTreeSet<String>,
}

/// Visibility-filtered search index document for one thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub thing_id: ThingId,
    pub thing_revision: i64,
    pub policy_id: Option<PolicyId>,
    pub policy_revision: Option<i64>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub modified: Option<DateTime<Utc>>,
    /// Subjects allowed to read at least one entry
    pub global_readers: BTreeSet<String>,
    pub entries: Vec<DocumentEntry>,
}

impl SearchDocument {
    /// Metadata view of this document as seen by background sync.
    pub fn sync_metadata(&self) -> SyncMetadata {
        SyncMetadata {
            thing_id: self.thing_id.clone(),
            thing_revision: self.thing_revision,
            policy_id: self.policy_id.clone(),
            policy_revision: self.policy_revision,
            modified: self.modified,
        }
    }

    /// Look up an entry by JSON pointer.
    pub fn entry(&self, path: &str) -> Option<&DocumentEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// Kind of a write model, used when interpreting bulk write results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteModelKind {
    Update,
    Patch,
    Delete,
}

/// Pending persistence change for one thing.
#[derive(Debug)]
pub enum WriteModel {
    /// Replace the whole document, inserting it if missing
    Update {
        metadata: ChangeMetadata,
        document: SearchDocument,
    },
    /// Replace the document only if the indexed revision equals `expected_revision`
    Patch {
        metadata: ChangeMetadata,
        expected_revision: i64,
        document: SearchDocument,
    },
    /// Remove the document
    Delete { metadata: ChangeMetadata },
}

impl WriteModel {
    pub fn kind(&self) -> WriteModelKind {
        match self {
            WriteModel::Update { .. } => WriteModelKind::Update,
            WriteModel::Patch { .. } => WriteModelKind::Patch,
            WriteModel::Delete { .. } => WriteModelKind::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind() == WriteModelKind::Delete
    }

    pub fn is_patch(&self) -> bool {
        self.kind() == WriteModelKind::Patch
    }

    pub fn metadata(&self) -> &ChangeMetadata {
        match self {
            WriteModel::Update { metadata, .. }
            | WriteModel::Patch { metadata, .. }
            | WriteModel::Delete { metadata } => metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ChangeMetadata {
        match self {
            WriteModel::Update { metadata, .. }
            | WriteModel::Patch { metadata, .. }
            | WriteModel::Delete { metadata } => metadata,
        }
    }

    pub fn into_metadata(self) -> ChangeMetadata {
        match self {
            WriteModel::Update { metadata, .. }
            | WriteModel::Patch { metadata, .. }
            | WriteModel::Delete { metadata } => metadata,
        }
    }

    pub fn thing_id(&self) -> &ThingId {
        &self.metadata().thing_id
    }

    pub fn document(&self) -> Option<&SearchDocument> {
        match self {
            WriteModel::Update { document, .. } | WriteModel::Patch { document, .. } => {
                Some(document)
            }
            WriteModel::Delete { .. } => None,
        }
    }
}
