//! Error types for the scheduler crate.
//!
//! Covers stream supervision, timestamp persistence and the scheduler
//! service lifecycle.

use thiserror::Error;

use searchsync_indexing::{IndexingError, ProviderError};
use searchsync_storage::StorageError;

/// Errors that can occur during stream supervision.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No forwarder started or stopped within the stuck threshold
    #[error("Supervisor of {sync_type} stuck for {idle_secs}s")]
    Stuck { sync_type: String, idle_secs: u64 },

    /// Invalid stream configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sync timestamp store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stream provider failure
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Forwarded element could not be handed to the updater
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Stream already registered under this sync type
    #[error("Stream already registered: {0}")]
    DuplicateStream(String),

    /// Scheduler is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Scheduler is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::Stuck {
            sync_type: "background-sync".to_string(),
            idle_secs: 3600,
        };
        assert!(err.to_string().contains("stuck for 3600s"));

        let err = SchedulerError::Config("interval must be > 0".to_string());
        assert!(err.to_string().contains("Configuration error"));

        let err = SchedulerError::DuplicateStream("catch-up".to_string());
        assert!(err.to_string().contains("already registered"));

        let err = SchedulerError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = SchedulerError::NotRunning;
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_from_indexing_error() {
        let err: SchedulerError = IndexingError::QueueClosed.into();
        assert!(matches!(err, SchedulerError::Indexing(IndexingError::QueueClosed)));
    }
}
