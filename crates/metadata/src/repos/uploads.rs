//! Upload registry repository.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploading: u64,
    pub completed: u64,
    /// Sum of `final_size` over completed uploads.
    pub completed_bytes: u64,
}

/// Fields written when an upload is finalized.
#[derive(Debug, Clone)]
pub struct UploadCompletion {
    pub final_path: String,
    pub final_size: i64,
    /// Server-computed hash of the assembled artifact (lowercase hex).
    pub content_hash: String,
    pub completed_at: OffsetDateTime,
}

/// Repository for upload records.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert a new upload record. Fails with `AlreadyExists` on a duplicate key.
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()>;

    /// Get an upload by file key.
    async fn get_upload(&self, file_key: Uuid) -> MetadataResult<Option<UploadRow>>;

    /// Find the earliest completed upload with the given content hash.
    async fn find_completed_by_hash(&self, content_hash: &str)
    -> MetadataResult<Option<UploadRow>>;

    /// Transition an upload from `uploading` to `completed`.
    ///
    /// Compare-and-swap on the status column: returns `false` without writing
    /// anything if the record is missing or already completed.
    async fn complete_upload(
        &self,
        file_key: Uuid,
        completion: &UploadCompletion,
    ) -> MetadataResult<bool>;

    /// Delete an upload record regardless of status. Returns `false` if absent.
    async fn delete_upload(&self, file_key: Uuid) -> MetadataResult<bool>;

    /// Delete an upload only if it is still `uploading` and was created before
    /// `older_than`. Returns `false` if the record no longer qualifies.
    async fn delete_stale_upload(
        &self,
        file_key: Uuid,
        older_than: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// In-progress uploads created before `older_than`, oldest first.
    async fn get_stale_uploads(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>>;

    /// Most recent uploads, optionally restricted to one owner.
    async fn list_uploads(
        &self,
        owner_id: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>>;

    /// Aggregate counts over all uploads.
    async fn upload_stats(&self) -> MetadataResult<UploadStats>;
}
