//! Key encoding and decoding for storage layer.
//!
//! Key format: `{prefix}:{sync_type}`
//! - ts: persisted sync timestamp of a sync type
//! - run: last run record of a sync type

use crate::error::StorageError;

/// Key for the persisted sync timestamp of one sync type.
/// Format: ts:{sync_type}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampKey {
    /// Sync type (e.g., "background_sync", "catch_up")
    pub sync_type: String,
}

impl TimestampKey {
    pub const PREFIX: &'static str = "ts:";

    pub fn new(sync_type: impl Into<String>) -> Self {
        Self {
            sync_type: sync_type.into(),
        }
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}", Self::PREFIX, self.sync_type).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        parse_prefixed(s, Self::PREFIX).map(Self::new)
    }
}

/// Key for the last run record of one sync type.
/// Format: run:{sync_type}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey {
    pub sync_type: String,
}

impl RunKey {
    pub const PREFIX: &'static str = "run:";

    pub fn new(sync_type: impl Into<String>) -> Self {
        Self {
            sync_type: sync_type.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}", Self::PREFIX, self.sync_type).into_bytes()
    }
}

fn parse_prefixed<'a>(s: &'a str, prefix: &str) -> Result<&'a str, StorageError> {
    match s.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => Ok(rest),
        _ => Err(StorageError::Key(format!("Invalid key format: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_key_roundtrip() {
        let key = TimestampKey::new("background_sync");
        assert_eq!(key.to_bytes(), b"ts:background_sync".to_vec());

        let decoded = TimestampKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_sync_type_may_contain_colons() {
        let key = TimestampKey::new("things:catch_up");
        let decoded = TimestampKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded.sync_type, "things:catch_up");
    }

    #[test]
    fn test_invalid_timestamp_key() {
        assert!(TimestampKey::from_bytes(b"run:background_sync").is_err());
        assert!(TimestampKey::from_bytes(b"ts:").is_err());
    }

    #[test]
    fn test_run_key_format() {
        assert_eq!(RunKey::new("catch_up").to_bytes(), b"run:catch_up".to_vec());
    }
}
