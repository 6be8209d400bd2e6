//! Cache error types.

use thiserror::Error;

/// Shared cache operation errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("wrong value type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
