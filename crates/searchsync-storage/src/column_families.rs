//! Column family definitions for RocksDB.
//!
//! - sync_timestamps: last successful sync point per sync type
//! - stream_runs: last run record per sync type, for status reporting

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for persisted sync timestamps
pub const CF_SYNC_TIMESTAMPS: &str = "sync_timestamps";

/// Column family name for stream run records
pub const CF_STREAM_RUNS: &str = "stream_runs";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_SYNC_TIMESTAMPS, CF_STREAM_RUNS];

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_SYNC_TIMESTAMPS, Options::default()),
        ColumnFamilyDescriptor::new(CF_STREAM_RUNS, Options::default()),
    ]
}
