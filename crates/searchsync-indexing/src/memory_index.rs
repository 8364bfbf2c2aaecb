//! In-memory search index.
//!
//! Reference [`BulkWriteSink`] that applies the revision guards of every
//! [`WriteOp`], reports counts and per-index errors the way a document store
//! does, and serves its own metadata for background sync.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::trace;

use searchsync_types::{SearchDocument, SyncMetadata, ThingId};

use crate::background_sync::{MetadataSource, MetadataStream};
use crate::bulk_write::{
    BulkWriteFailure, BulkWriteResult, BulkWriteSink, IndexedWriteError, WriteConcern, WriteOp,
};

/// Documents keyed by thing id.
#[derive(Default)]
pub struct InMemoryIndex {
    documents: RwLock<BTreeMap<ThingId, SearchDocument>>,
    injected: Mutex<Option<BulkWriteFailure>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document bypassing all guards.
    pub fn insert(&self, document: SearchDocument) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document.thing_id.clone(), document);
    }

    pub fn get(&self, thing_id: &ThingId) -> Option<SearchDocument> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thing_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata of all indexed documents, ordered by thing id.
    pub fn sync_metadata(&self) -> Vec<SyncMetadata> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(SearchDocument::sync_metadata)
            .collect()
    }

    /// Fail the next bulk write with `failure` without applying anything.
    pub fn inject_failure(&self, failure: BulkWriteFailure) {
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }

    fn apply(
        documents: &mut BTreeMap<ThingId, SearchDocument>,
        index: usize,
        op: WriteOp,
        result: &mut BulkWriteResult,
        errors: &mut Vec<IndexedWriteError>,
    ) {
        match op {
            WriteOp::Upsert { document } => match documents.get(&document.thing_id) {
                Some(existing) if WriteOp::upsert_applies(&existing.sync_metadata(), &document) => {
                    result.matched += 1;
                    result.modified += 1;
                    documents.insert(document.thing_id.clone(), document);
                }
                Some(existing) => {
                    trace!(
                        thing_id = %document.thing_id,
                        indexed_revision = existing.thing_revision,
                        revision = document.thing_revision,
                        "Upsert lost against indexed document"
                    );
                    errors.push(IndexedWriteError::duplicate_key(index));
                }
                None => {
                    result.upserted += 1;
                    documents.insert(document.thing_id.clone(), document);
                }
            },
            WriteOp::PatchReplace {
                expected_revision,
                document,
            } => {
                let applies = documents
                    .get(&document.thing_id)
                    .is_some_and(|existing| existing.thing_revision == expected_revision);
                if applies {
                    result.matched += 1;
                    result.modified += 1;
                    documents.insert(document.thing_id.clone(), document);
                }
            }
            WriteOp::Delete { thing_id, revision } => {
                let applies = documents
                    .get(&thing_id)
                    .is_some_and(|existing| existing.thing_revision <= revision);
                if applies {
                    documents.remove(&thing_id);
                    result.deleted += 1;
                }
            }
        }
    }
}

#[async_trait]
impl BulkWriteSink for InMemoryIndex {
    async fn bulk_write(
        &self,
        ops: Vec<WriteOp>,
        concern: WriteConcern,
    ) -> Result<BulkWriteResult, BulkWriteFailure> {
        if let Some(failure) = self
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(failure);
        }

        let mut result = BulkWriteResult::acknowledged();
        let mut errors = Vec::new();
        {
            let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
            for (index, op) in ops.into_iter().enumerate() {
                Self::apply(&mut documents, index, op, &mut result, &mut errors);
            }
        }
        trace!(concern = ?concern, result = ?result, errors = errors.len(), "Applied bulk write");

        if errors.is_empty() {
            Ok(result)
        } else {
            Err(BulkWriteFailure::Partial { result, errors })
        }
    }
}

impl MetadataSource for InMemoryIndex {
    fn metadata_stream(&self) -> MetadataStream {
        stream::iter(self.sync_metadata().into_iter().map(Ok)).boxed()
    }
}
