//! Key-value storage seam for section locks and saved versions.
//!
//! ```text
//! ┌──────────────┐   get / set(ttl, if_absent) / delete   ┌──────────────┐
//! │ CollabSession│ ─────────────────────────────────────► │ KeyValueStore│
//! └──────────────┘                                         └──────┬───────┘
//!                                                   ┌─────────────┴─────────────┐
//!                                                   ▼                           ▼
//!                                            MemoryStore                  RocksStore
//!                                            (in-process, TTL)            (RocksDB, LZ4)
//! ```
//!
//! Set-if-absent is the only cross-site mutual-exclusion point of the editor,
//! so implementations must make it atomic, together with the compare-and-set
//! and compare-and-delete used to refresh and release a lock. Expiry is the store's business; the
//! session never polls for it.

pub mod envelope;
pub mod memory;
pub mod rocks;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use envelope::StoredValue;
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Key namespace for section locks.
pub const LOCK_KEY_PREFIX: &str = "document_lock";
/// Key namespace for saved versions.
pub const VERSION_KEY_PREFIX: &str = "document_versions";

/// `document_lock:{documentId}:{start}_{end}`
pub fn lock_key(document_id: &str, start: usize, end: usize) -> String {
    format!("{LOCK_KEY_PREFIX}:{document_id}:{start}_{end}")
}

/// `document_versions:{documentId}:{versionId}`
pub fn version_key(document_id: &str, version_id: &str) -> String {
    format!("{VERSION_KEY_PREFIX}:{document_id}:{version_id}")
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Async key-value store with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Current value, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value`. With `if_absent`, only succeeds when no live value exists.
    /// Returns whether the value was written.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, StoreError>;

    /// Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Overwrite `value` (with a fresh `ttl`) only if the live stored value
    /// equals `expected`. Returns whether the value was written.
    ///
    /// The default is a non-atomic get-then-set; the bundled stores override
    /// it with an atomic version.
    async fn set_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.set(key, value, ttl, false).await,
            _ => Ok(false),
        }
    }

    /// Delete only if the stored value equals `expected`.
    ///
    /// The default is a non-atomic get-then-delete; the bundled stores override
    /// it with an atomic version.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.delete(key).await,
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(lock_key("doc-7", 0, 10), "document_lock:doc-7:0_10");
        assert_eq!(version_key("doc-7", "v1"), "document_versions:doc-7:v1");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("boom".into());
        assert!(err.to_string().contains("Database error"));
        let err = StoreError::Unavailable("offline".into());
        assert!(err.to_string().contains("offline"));
    }
}
