//! On-disk value envelope: expiry deadline plus optionally LZ4-compressed payload.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ StoredValue (bincode)                        │
//! │  expires_at_ms: Option<u64>   unix millis    │
//! │  compressed:    bool                         │
//! │  payload:       Vec<u8>       raw or LZ4     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Version snapshots carry the whole document plus its operation log, so they
//! compress well. Lock records are a few bytes and stay raw.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub expires_at_ms: Option<u64>,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl StoredValue {
    /// Wrap `value`, compressing when it is at least `compression_threshold` bytes.
    pub fn wrap(value: &[u8], ttl: Option<Duration>, now_ms: u64, compression_threshold: usize) -> Self {
        let expires_at_ms = ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as u64));
        if value.len() >= compression_threshold {
            Self {
                expires_at_ms,
                compressed: true,
                payload: lz4_flex::compress_prepend_size(value),
            }
        } else {
            Self {
                expires_at_ms,
                compressed: false,
                payload: value.to_vec(),
            }
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
    }

    /// The original value bytes.
    pub fn unwrap_payload(&self) -> Result<Vec<u8>, StoreError> {
        if self.compressed {
            lz4_flex::decompress_size_prepended(&self.payload)
                .map_err(|e| StoreError::Compression(e.to_string()))
        } else {
            Ok(self.payload.clone())
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    /// Stored size over original size.
    pub fn compression_ratio(&self, original_len: usize) -> f64 {
        if self.payload.is_empty() {
            return 0.0;
        }
        original_len as f64 / self.payload.len() as f64
    }
}
