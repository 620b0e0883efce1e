//! # Cache Errors

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the cache itself
///
/// Failures of the caller's compute function are passed through
/// unchanged and never wrapped in this type.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Value could not be serialized for storage
    #[error("Failed to encode cached value: {0}")]
    Encode(String),

    /// Stored bytes do not decode as the requested type
    #[error("Failed to decode cached value: {0}")]
    Decode(String),
}

impl CacheError {
    /// Returns the caller-facing error class
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Internal
    }
}
