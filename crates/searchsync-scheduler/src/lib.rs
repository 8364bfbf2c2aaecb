//! Periodic stream supervision for searchsync.
//!
//! A stream supervisor owns one sync type. It derives query windows from the
//! persisted sync timestamp, runs one forwarder per window and only advances
//! the timestamp after every forwarded change was acknowledged.
//!
//! # Features
//!
//! - Triggers with fixed-width windows and a start offset
//! - Forwarders with acknowledgement tracking and idle timeout
//! - Self-checking supervisors restarted with fresh state when stuck
//! - Status registry with `Up` / `Warning` / `Down` health per stream
//! - Timestamp stores in memory or in RocksDB
//! - Background sync and catch-up workloads feeding the change queue
//!
//! # Example
//!
//! ```ignore
//! use searchsync_scheduler::jobs::{BackgroundSyncProvider, ChangeQueueRecipient, BACKGROUND_SYNC};
//! use searchsync_scheduler::{StreamScheduler, StreamSupervisor, StorageTimestampStore};
//!
//! let supervisor = StreamSupervisor::new(
//!     BACKGROUND_SYNC,
//!     Arc::new(BackgroundSyncProvider::new(sync)),
//!     Arc::new(ChangeQueueRecipient::new(pipeline.queue())),
//!     Arc::new(StorageTimestampStore::new(storage)),
//! )
//! .with_config(StreamConfig::from_settings(&settings.stream));
//!
//! let mut scheduler = StreamScheduler::new();
//! scheduler.add_stream(supervisor)?;
//! scheduler.start()?;
//! ```

mod config;
mod error;
mod forwarder;
mod registry;
mod scheduler;
mod supervisor;
mod timestamp;
mod trigger;

pub mod jobs;

pub use config::StreamConfig;
pub use error::SchedulerError;
pub use forwarder::{Forwarder, ForwarderOutcome, StreamProvider, StreamRecipient};
pub use registry::{StreamHealth, StreamRegistry, StreamResult, StreamStatus};
pub use scheduler::StreamScheduler;
pub use supervisor::StreamSupervisor;
pub use timestamp::{InMemoryTimestampStore, StorageTimestampStore, TimestampStore};
pub use trigger::StreamTrigger;
