//! Persisted sync timestamps.
//!
//! A sync type's timestamp is the end of the last query window that was
//! forwarded and acknowledged end to end. It is read once at supervisor
//! startup and written after every successful stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use searchsync_storage::{Storage, StreamRunRecord};

use crate::SchedulerError;

/// Store of the last successful sync point per sync type.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    async fn get(&self, sync_type: &str) -> Result<Option<DateTime<Utc>>, SchedulerError>;

    async fn set(&self, sync_type: &str, timestamp: DateTime<Utc>) -> Result<(), SchedulerError>;

    /// Remember the outcome of a stream run. Stores may ignore it.
    async fn record_run(
        &self,
        _sync_type: &str,
        _record: &StreamRunRecord,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// Volatile store for tests and embedding.
#[derive(Default)]
pub struct InMemoryTimestampStore {
    timestamps: Mutex<HashMap<String, DateTime<Utc>>>,
    runs: Mutex<HashMap<String, StreamRunRecord>>,
}

impl InMemoryTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded run of a sync type.
    pub fn last_run(&self, sync_type: &str) -> Option<StreamRunRecord> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sync_type)
            .cloned()
    }
}

#[async_trait]
impl TimestampStore for InMemoryTimestampStore {
    async fn get(&self, sync_type: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self
            .timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sync_type)
            .copied())
    }

    async fn set(&self, sync_type: &str, timestamp: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sync_type.to_string(), timestamp);
        Ok(())
    }

    async fn record_run(
        &self,
        sync_type: &str,
        record: &StreamRunRecord,
    ) -> Result<(), SchedulerError> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sync_type.to_string(), record.clone());
        Ok(())
    }
}

/// Durable store backed by RocksDB.
pub struct StorageTimestampStore {
    storage: Arc<Storage>,
}

impl StorageTimestampStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TimestampStore for StorageTimestampStore {
    async fn get(&self, sync_type: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self
            .storage
            .get_sync_timestamp(sync_type)?
            .map(|record| record.timestamp))
    }

    async fn set(&self, sync_type: &str, timestamp: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.storage.put_sync_timestamp(sync_type, timestamp)?;
        Ok(())
    }

    async fn record_run(
        &self,
        sync_type: &str,
        record: &StreamRunRecord,
    ) -> Result<(), SchedulerError> {
        self.storage.put_run_record(sync_type, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_record(success: bool) -> StreamRunRecord {
        let now = Utc::now();
        StreamRunRecord {
            window_start: now,
            window_end: now,
            started_at: now,
            finished_at: now,
            success,
            message: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryTimestampStore::new();
        assert!(store.get("background-sync").await.unwrap().is_none());

        let now = Utc::now();
        store.set("background-sync", now).await.unwrap();
        assert_eq!(store.get("background-sync").await.unwrap(), Some(now));
        assert!(store.get("catch-up").await.unwrap().is_none());

        store.record_run("catch-up", &run_record(false)).await.unwrap();
        assert!(!store.last_run("catch-up").unwrap().success);
    }

    #[tokio::test]
    async fn test_storage_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let ts = Utc::now();
        {
            let storage = Arc::new(Storage::open(dir.path()).unwrap());
            let store = StorageTimestampStore::new(storage.clone());
            store.set("background-sync", ts).await.unwrap();
            store.record_run("background-sync", &run_record(true)).await.unwrap();
        }

        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let store = StorageTimestampStore::new(storage.clone());
        assert_eq!(store.get("background-sync").await.unwrap(), Some(ts));
        assert!(storage.get_run_record("background-sync").unwrap().unwrap().success);
    }
}
