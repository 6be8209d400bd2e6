//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid row for upload {file_key}: {reason}")]
    InvalidRow { file_key: String, reason: String },
}

impl MetadataError {
    /// Whether the failure is likely to clear up on retry (pool exhaustion,
    /// a busy database, connection I/O).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            Self::Database(sqlx::Error::Database(db)) => {
                let message = db.message();
                message.contains("database is locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MetadataError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!MetadataError::NotFound("x".to_string()).is_transient());
        assert!(!MetadataError::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_invalid_row_message() {
        let err = MetadataError::InvalidRow {
            file_key: "k".to_string(),
            reason: "bad status".to_string(),
        };
        assert_eq!(err.to_string(), "invalid row for upload k: bad status");
    }
}
