//! Storage layer for searchsync.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for sync timestamps and run records
//! - One persisted sync point per sync type, written only after a full
//!   stream window was acknowledged end to end
//! - Listing and reset for the admin CLI

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::{Storage, StorageStats, StreamRunRecord, SyncTimestampRecord};
pub use error::StorageError;
pub use keys::{RunKey, TimestampKey};
