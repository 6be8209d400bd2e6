//! Engine error taxonomy.

use parcel_cache::CacheError;
use parcel_core::FileKey;
use parcel_metadata::MetadataError;
use parcel_storage::StorageError;
use thiserror::Error;

/// Errors returned by [`crate::UploadEngine`] operations.
///
/// Every variant has a stable [`code`](UploadError::code) and a
/// [`retryability`](UploadError::is_retryable) so calling layers never need
/// to match on messages.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid category: {0}")]
    InvalidCategory(String),

    #[error("file too large: {size} bytes exceeds the limit of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("upload not found: {0}")]
    NotFound(FileKey),

    #[error("permission denied for upload {0}")]
    PermissionDenied(FileKey),

    #[error("too many concurrent chunk writes for upload {file_key} (limit {limit})")]
    TooManyConcurrentUploads { file_key: FileKey, limit: u32 },

    #[error("upload {file_key} is incomplete: chunk {missing_index} has not been received")]
    IncompleteUpload { file_key: FileKey, missing_index: u32 },

    #[error("upload {0} is already completed")]
    AlreadyCompleted(FileKey),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("I/O failure: {0}")]
    Io(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl UploadError {
    /// Stable snake_case identifier for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCategory(_) => "invalid_category",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::TooManyConcurrentUploads { .. } => "too_many_concurrent_uploads",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::AlreadyCompleted(_) => "already_completed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::Io(_) => "io_failure",
            Self::Metadata(_) => "metadata_error",
            Self::Cache(_) => "cache_error",
        }
    }

    /// Whether the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TooManyConcurrentUploads { .. } | Self::Io(_) | Self::Cache(_) => true,
            Self::Metadata(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<parcel_core::Error> for UploadError {
    fn from(err: parcel_core::Error) -> Self {
        match err {
            parcel_core::Error::InvalidCategory(category) => Self::InvalidCategory(category),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;
