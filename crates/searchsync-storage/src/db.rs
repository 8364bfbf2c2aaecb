//! RocksDB wrapper for searchsync storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Sync timestamp get/set/delete/list per sync type
//! - Last stream run record per sync type

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, ALL_CF_NAMES, CF_STREAM_RUNS, CF_SYNC_TIMESTAMPS};
use crate::error::StorageError;
use crate::keys::{RunKey, TimestampKey};

/// Persisted sync point of one sync type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTimestampRecord {
    /// End of the last fully acknowledged query window
    pub timestamp: DateTime<Utc>,
    /// When the record was written
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the most recent stream run of one sync type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRunRecord {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Main storage interface for searchsync
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(2);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        Ok(Self { db })
    }

    // ==================== Sync Timestamps ====================

    /// Persist the sync point of a sync type, replacing any previous one.
    pub fn put_sync_timestamp(
        &self,
        sync_type: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let record = SyncTimestampRecord {
            timestamp,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.put(CF_SYNC_TIMESTAMPS, &TimestampKey::new(sync_type).to_bytes(), &bytes)?;
        debug!(sync_type, timestamp = %timestamp, "Stored sync timestamp");
        Ok(())
    }

    /// Read the persisted sync point of a sync type.
    pub fn get_sync_timestamp(
        &self,
        sync_type: &str,
    ) -> Result<Option<SyncTimestampRecord>, StorageError> {
        let key = TimestampKey::new(sync_type);
        match self.get(CF_SYNC_TIMESTAMPS, &key.to_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the persisted sync point. Returns whether one existed.
    pub fn delete_sync_timestamp(&self, sync_type: &str) -> Result<bool, StorageError> {
        let key = TimestampKey::new(sync_type).to_bytes();
        let existed = self.get(CF_SYNC_TIMESTAMPS, &key)?.is_some();
        if existed {
            self.delete(CF_SYNC_TIMESTAMPS, &key)?;
            info!(sync_type, "Reset sync timestamp");
        }
        Ok(existed)
    }

    /// All persisted sync points, ordered by sync type.
    pub fn list_sync_timestamps(&self) -> Result<Vec<(String, SyncTimestampRecord)>, StorageError> {
        let mut results = Vec::new();
        for (key, value) in self.prefix_iterator(CF_SYNC_TIMESTAMPS, TimestampKey::PREFIX.as_bytes())? {
            let key = TimestampKey::from_bytes(&key)?;
            let record: SyncTimestampRecord = serde_json::from_slice(&value)?;
            results.push((key.sync_type, record));
        }
        Ok(results)
    }

    // ==================== Run Records ====================

    /// Store the outcome of the latest stream run of a sync type.
    pub fn put_run_record(
        &self,
        sync_type: &str,
        record: &StreamRunRecord,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(record)?;
        self.put(CF_STREAM_RUNS, &RunKey::new(sync_type).to_bytes(), &bytes)
    }

    pub fn get_run_record(&self, sync_type: &str) -> Result<Option<StreamRunRecord>, StorageError> {
        match self.get(CF_STREAM_RUNS, &RunKey::new(sync_type).to_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }

    // ===== Generic Column Family Operations =====

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))?;
        self.db.put_cf(&cf, key, value)?;
        Ok(())
    }

    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))?;
        let result = self.db.get_cf(&cf, key)?;
        Ok(result)
    }

    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))?;
        self.db.delete_cf(&cf, key)?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn prefix_iterator(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }

        Ok(results)
    }

    // ===== Admin Operations =====

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        if let Some(cf) = self.db.cf_handle(CF_SYNC_TIMESTAMPS) {
            stats.timestamp_count = self.count_cf_entries(cf)?;
        }
        if let Some(cf) = self.db.cf_handle(CF_STREAM_RUNS) {
            stats.run_record_count = self.count_cf_entries(cf)?;
        }

        stats.disk_usage_bytes = self.get_disk_usage();

        Ok(stats)
    }

    fn count_cf_entries(&self, cf: &rocksdb::ColumnFamily) -> Result<u64, StorageError> {
        let mut count = 0u64;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> u64 {
        let path = self.db.path();
        let mut total_size = 0u64;

        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }

        total_size
    }
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Number of persisted sync timestamps
    pub timestamp_count: u64,
    /// Number of stream run records
    pub run_record_count: u64,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}
