// src/error.rs
//! Error types for cache operations

use thiserror::Error;

/// Errors surfaced by the cache engine
#[derive(Error, Debug)]
pub enum CacheError {
    /// Digest failed the format check (64 lowercase hex characters)
    #[error("invalid digest '{digest}': expected {expected} lowercase hex characters")]
    InvalidDigest { digest: String, expected: usize },

    /// The item is bigger than the cache size limit
    #[error("item of {size} bytes exceeds the cache size limit of {max_size} bytes")]
    TooBig { size: i64, max_size: i64 },

    /// Uploaded content does not hash to the declared digest
    #[error("content hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Byte count differs from the declared size
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    /// Upstream proxy request failed (transport error or non-2xx status)
    #[error("upstream proxy request failed: {reason}")]
    Proxy { reason: String },

    /// Action cache payload could not be decoded
    #[error("malformed action result: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Create a proxy error from any displayable failure
    pub fn proxy(reason: impl Into<String>) -> Self {
        Self::Proxy {
            reason: reason.into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
