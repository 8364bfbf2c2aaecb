//! Background sync workload.
//!
//! Each run performs one full comparison of the authoritative store against
//! the index. The trigger window only paces the runs, the comparison itself
//! always covers every entity.

use searchsync_indexing::{BackgroundSync, RepairStream};

use crate::forwarder::StreamProvider;
use crate::trigger::StreamTrigger;

/// Sync type of the background sync stream.
pub const BACKGROUND_SYNC: &str = "background-sync";

/// Stream provider running a full background sync per trigger.
pub struct BackgroundSyncProvider {
    sync: BackgroundSync,
}

impl BackgroundSyncProvider {
    pub fn new(sync: BackgroundSync) -> Self {
        Self { sync }
    }
}

impl StreamProvider for BackgroundSyncProvider {
    fn start_streaming(&self, _trigger: &StreamTrigger) -> RepairStream {
        self.sync.repair_stream()
    }
}
