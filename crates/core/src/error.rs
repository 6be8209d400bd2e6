//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file key: {0}")]
    InvalidFileKey(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid category: {0}")]
    InvalidCategory(String),

    #[error("invalid upload status: {0}")]
    InvalidStatus(String),

    #[error("invalid upload record: {0}")]
    InvalidRecord(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
