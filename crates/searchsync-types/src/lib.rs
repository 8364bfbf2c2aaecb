//! # searchsync-types
//!
//! Shared domain types for the searchsync pipeline.
//!
//! This crate defines the core data structures used throughout the system:
//! - Change metadata: pending, mergeable changes of one thing
//! - Events and acknowledgements flowing between originators and the updater
//! - Write models and search documents produced by enforcement
//! - Policy enforcers deciding read visibility
//! - Settings: Configuration types
//!
//! ## Usage
//!
//! ```rust
//! use searchsync_types::{ChangeMetadata, ThingId};
//!
//! let change = ChangeMetadata::new(ThingId::new("ns:thing"), 3);
//! assert_eq!(change.thing_revision, 3);
//! ```

pub mod ack;
pub mod change;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod latency;
pub mod policy;
pub mod sync;
pub mod write_model;

pub use ack::{AckRecipient, AckStatus, Acknowledgement};
pub use change::{ChangeMetadata, ChangeNotification};
pub use config::{
    BackgroundSyncSettings, CacheSettings, Settings, StreamSettings, UpdaterSettings,
};
pub use error::SearchSyncError;
pub use event::{is_contiguous, ThingEvent, ThingEventKind};
pub use ids::{PolicyId, ThingId};
pub use latency::{LatencySegment, LatencyTimer};
pub use policy::{Effect, PolicyEnforcer, ReadPermission};
pub use sync::SyncMetadata;
pub use write_model::{DocumentEntry, SearchDocument, WriteModel, WriteModelKind};
