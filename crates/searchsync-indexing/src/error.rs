//! Error types for the indexing pipeline.

use thiserror::Error;

/// Errors reported by external collaborators (entity store, policy store,
/// index metadata stream).
///
/// Callers in the pipeline treat every variant as logical absence for the
/// current cycle; the variants only matter for logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The collaborator could not be reached or answered with an error
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The collaborator did not answer in time
    #[error("Provider timed out: {0}")]
    Timeout(String),
}

/// Errors that can occur in the indexing pipeline
#[derive(Error, Debug)]
pub enum IndexingError {
    /// The change queue actor is gone
    #[error("Change queue closed")]
    QueueClosed,

    /// No search update mapper registered under this name
    #[error("Unknown mapper: {0}")]
    UnknownMapper(String),

    /// Invalid pipeline configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Collaborator failure that could not be treated as absence
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic index operation error
    #[error("Index error: {0}")]
    Index(String),
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexingError::UnknownMapper("fancy".to_string());
        assert_eq!(err.to_string(), "Unknown mapper: fancy");

        let err = IndexingError::Serialization("invalid json".to_string());
        assert_eq!(err.to_string(), "Serialization error: invalid json");

        let err: IndexingError = ProviderError::Timeout("policies".to_string()).into();
        assert_eq!(err.to_string(), "Provider error: Provider timed out: policies");
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let indexing_err: IndexingError = json_err.into();
        assert!(matches!(indexing_err, IndexingError::Serialization(_)));
    }
}
