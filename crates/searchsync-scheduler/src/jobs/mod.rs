//! Stream workloads and recipients.
//!
//! # Available providers
//!
//! - **background_sync**: compares the authoritative store with the index
//!   and emits repairs for every divergence
//! - **catch_up**: re-forwards everything modified inside the window
//!
//! # Recipients
//!
//! - **change_queue**: hands forwarded changes to the updater's change queue

pub mod background_sync;
pub mod catch_up;
pub mod change_queue;

pub use background_sync::{BackgroundSyncProvider, BACKGROUND_SYNC};
pub use catch_up::{CatchUpProvider, ModifiedThingsSource, CATCH_UP};
pub use change_queue::ChangeQueueRecipient;
