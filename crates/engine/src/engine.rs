//! The upload engine: initialization, chunk acceptance, merge and deletion.

use crate::chunk_store::{ArtifactStore, ChunkStore};
use crate::error::{UploadError, UploadResult};
use crate::gate::ConcurrencyGate;
use crate::locks::UploadLocks;
use crate::metrics::{
    CHUNK_BYTES_ACCEPTED, CHUNKS_ACCEPTED, MERGE_DURATION, MERGE_FAILURES, UPLOADS_DEDUPLICATED,
    UPLOADS_DELETED, UPLOADS_INITIALIZED, UPLOADS_MERGED, record_upload_error,
};
use crate::sweeper::ExpirySweeper;
use crate::tracker::ChunkTracker;
use bytes::Bytes;
use futures::StreamExt;
use parcel_cache::{MemoryCache, SharedCache, spawn_cleanup_task};
use parcel_core::config::{AppConfig, EngineConfig, SweeperConfig};
use parcel_core::{
    Actor, CategorySet, ContentHash, ContentHasher, FileKey, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE,
    UploadRecord, UploadStatus,
};
use parcel_metadata::{MetadataStore, UploadCompletion, UploadRow, UploadStats};
use parcel_storage::{StorageRoots, StreamingUpload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Parameters of a new upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub file_name: String,
    pub category: String,
    pub chunk_count: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    /// Client-computed MD5 of the whole file, hex encoded.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub origin_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub file_key: FileKey,
    /// True when an already completed upload with the same content answered
    /// the request and nothing new was created.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkAccepted {
    pub all_chunks_present: bool,
    /// Distinct chunk indices received so far.
    pub received: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Artifact location relative to the final root.
    pub final_path: String,
    pub final_size: u64,
    pub content_hash: String,
}

/// Orchestrates the upload lifecycle over the metadata store, the shared
/// cache and the two storage roots.
///
/// Each operation authorizes once at entry through [`Actor::can_access`].
/// Chunk writes on one upload run in parallel (bounded by the
/// [`ConcurrencyGate`]); merge and delete exclude them through a per-upload
/// lock, and the completion write is a compare-and-swap on the status.
pub struct UploadEngine {
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<dyn SharedCache>,
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    tracker: ChunkTracker,
    gate: ConcurrencyGate,
    locks: Arc<UploadLocks>,
    categories: CategorySet,
    config: EngineConfig,
    cache_reaper: Option<JoinHandle<()>>,
}

impl UploadEngine {
    pub fn new(
        config: EngineConfig,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<dyn SharedCache>,
        storage: StorageRoots,
    ) -> UploadResult<Self> {
        config
            .validate()
            .map_err(|e| UploadError::InvalidRequest(format!("invalid engine config: {e}")))?;
        let categories = CategorySet::new(config.allowed_categories.iter().cloned())?;

        Ok(Self {
            tracker: ChunkTracker::new(cache.clone(), config.presence_ttl()),
            gate: ConcurrencyGate::new(
                cache.clone(),
                config.max_concurrent_chunk_writes,
                config.slot_ttl(),
            ),
            chunks: ChunkStore::new(storage.chunks),
            artifacts: ArtifactStore::new(storage.artifacts),
            locks: Arc::new(UploadLocks::new()),
            metadata,
            cache,
            categories,
            config,
            cache_reaper: None,
        })
    }

    /// Build an engine with every backend taken from configuration and an
    /// in-process cache whose expired entries are reaped in the background.
    pub async fn from_config(config: &AppConfig) -> UploadResult<Self> {
        config
            .validate()
            .map_err(|e| UploadError::InvalidRequest(format!("invalid configuration: {e}")))?;

        let metadata = parcel_metadata::from_config(&config.metadata).await?;
        let storage = parcel_storage::from_config(&config.storage).await?;
        let cache = Arc::new(MemoryCache::new());
        let reaper = spawn_cleanup_task(cache.clone(), config.cache.cleanup_interval());

        let mut engine = Self::new(config.engine.clone(), metadata, cache, storage)?;
        engine.cache_reaper = Some(reaper);
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// An expiry sweeper working on the same stores and locks as this engine.
    pub fn sweeper(&self, config: SweeperConfig) -> ExpirySweeper {
        ExpirySweeper::new(
            self.metadata.clone(),
            self.chunks.clone(),
            self.artifacts.clone(),
            self.tracker.clone(),
            self.locks.clone(),
            config,
        )
    }

    /// Register a new upload, or answer with an existing completed upload of
    /// identical content.
    #[tracing::instrument(skip(self, request, actor), fields(actor = %actor.id, category = %request.category))]
    pub async fn initialize(
        &self,
        request: InitRequest,
        actor: &Actor,
    ) -> UploadResult<InitOutcome> {
        let result = self.initialize_inner(request, actor).await;
        observe_error(&result);
        result
    }

    async fn initialize_inner(
        &self,
        request: InitRequest,
        actor: &Actor,
    ) -> UploadResult<InitOutcome> {
        self.categories.validate(&request.category)?;

        if request.total_size > self.config.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: request.total_size,
                max: self.config.max_file_size,
            });
        }

        validate_shape(&request)?;

        let content_hash = request
            .content_hash
            .as_deref()
            .map(ContentHash::from_hex)
            .transpose()?;

        if let Some(hash) = content_hash
            && let Some(existing) = self.metadata.find_completed_by_hash(&hash.to_hex()).await?
        {
            let file_key = FileKey::from_uuid(existing.file_key);
            UPLOADS_DEDUPLICATED.inc();
            tracing::info!(file_key = %file_key, "Upload deduplicated against completed upload");
            return Ok(InitOutcome {
                file_key,
                deduplicated: true,
            });
        }

        let now = OffsetDateTime::now_utc();
        let record = UploadRecord {
            file_key: FileKey::new(),
            file_name: request.file_name,
            category: request.category,
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            chunk_count: request.chunk_count,
            content_hash,
            status: UploadStatus::Uploading,
            owner_id: actor.id.clone(),
            origin_ip: request.origin_ip,
            created_at: now,
            updated_at: now,
            completed_at: None,
            final_path: None,
            final_size: None,
        };
        self.metadata
            .create_upload(&UploadRow::from_record(&record)?)
            .await?;

        if record.chunk_count > 1 {
            self.tracker.init(&record.file_key).await?;
        }

        UPLOADS_INITIALIZED.inc();
        tracing::info!(
            file_key = %record.file_key,
            total_size = record.total_size,
            chunk_count = record.chunk_count,
            "Upload initialized"
        );

        Ok(InitOutcome {
            file_key: record.file_key,
            deduplicated: false,
        })
    }

    /// Write one chunk payload. Re-sending an index overwrites it.
    #[tracing::instrument(
        skip(self, data, actor),
        fields(file_key = %file_key, chunk_index = index, size = data.len())
    )]
    pub async fn accept_chunk(
        &self,
        file_key: &FileKey,
        index: u32,
        data: Bytes,
        actor: &Actor,
    ) -> UploadResult<ChunkAccepted> {
        let guard = self.locks.read(file_key).await;
        let result = self.accept_chunk_locked(file_key, index, data, actor).await;
        drop(guard);
        self.locks.forget(file_key);
        observe_error(&result);
        result
    }

    async fn accept_chunk_locked(
        &self,
        file_key: &FileKey,
        index: u32,
        data: Bytes,
        actor: &Actor,
    ) -> UploadResult<ChunkAccepted> {
        let record = self.load(file_key).await?;
        self.categories.validate(&record.category)?;
        authorize(actor, &record)?;

        if record.status == UploadStatus::Completed {
            return Err(UploadError::AlreadyCompleted(*file_key));
        }
        if index >= record.chunk_count {
            return Err(UploadError::InvalidRequest(format!(
                "chunk index {index} out of range (chunk count {})",
                record.chunk_count
            )));
        }
        let size = data.len() as u64;
        if size > record.chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk payload of {size} bytes exceeds declared chunk size {}",
                record.chunk_size
            )));
        }
        if size == 0 && record.total_size > 0 {
            return Err(UploadError::InvalidRequest("empty chunk payload".to_string()));
        }

        let permit = self.gate.acquire(file_key).await?;
        let written = self.chunks.put(file_key, index, data).await;
        self.gate.release(permit).await;
        written?;

        if record.chunk_count > 1 && !self.tracker.is_tracked(file_key).await? {
            self.restore_presence(file_key).await?;
        }
        self.tracker.mark(file_key, index).await?;
        let received = u32::try_from(self.tracker.received_count(file_key).await?)
            .unwrap_or(u32::MAX);

        CHUNKS_ACCEPTED.inc();
        CHUNK_BYTES_ACCEPTED.inc_by(size);
        tracing::debug!(received, chunk_count = record.chunk_count, "Chunk accepted");

        Ok(ChunkAccepted {
            all_chunks_present: received >= record.chunk_count,
            received,
        })
    }

    /// Rebuild an expired presence set from the chunk files on disk.
    async fn restore_presence(&self, file_key: &FileKey) -> UploadResult<()> {
        let on_disk = self.chunks.present_indices(file_key).await?;
        for index in &on_disk {
            self.tracker.mark(file_key, *index).await?;
        }
        if !on_disk.is_empty() {
            tracing::debug!(
                file_key = %file_key,
                restored = on_disk.len(),
                "Presence set restored from chunk files"
            );
        }
        Ok(())
    }

    /// Whether a chunk has been received. Falls back to the chunk file when
    /// the presence set does not know the index.
    pub async fn chunk_exists(&self, file_key: &FileKey, index: u32) -> UploadResult<bool> {
        if self.tracker.contains(file_key, index).await? {
            return Ok(true);
        }
        Ok(self.chunks.exists(file_key, index).await?)
    }

    /// Indices still to be sent, ascending. Empty once completed.
    pub async fn missing_chunks(&self, file_key: &FileKey) -> UploadResult<Vec<u32>> {
        let record = self.load(file_key).await?;
        if record.status == UploadStatus::Completed {
            return Ok(Vec::new());
        }
        self.missing_for(&record).await
    }

    async fn missing_for(&self, record: &UploadRecord) -> UploadResult<Vec<u32>> {
        let mut missing = self
            .tracker
            .missing(&record.file_key, record.chunk_count)
            .await?;
        if missing.is_empty() {
            return Ok(missing);
        }
        let on_disk = self.chunks.present_indices(&record.file_key).await?;
        missing.retain(|index| !on_disk.contains(index));
        Ok(missing)
    }

    /// Assemble all chunks in index order into the final artifact and mark
    /// the upload completed.
    ///
    /// The artifact is written to a temp file and renamed into place before
    /// the status changes; any failure up to the status change leaves the
    /// upload `Uploading` with its chunks intact.
    #[tracing::instrument(skip(self, actor), fields(file_key = %file_key))]
    pub async fn merge(&self, file_key: &FileKey, actor: &Actor) -> UploadResult<MergeOutcome> {
        let guard = self.locks.write(file_key).await;
        let result = self.merge_locked(file_key, actor).await;
        drop(guard);
        self.locks.forget(file_key);
        observe_error(&result);
        result
    }

    async fn merge_locked(&self, file_key: &FileKey, actor: &Actor) -> UploadResult<MergeOutcome> {
        let record = self.load(file_key).await?;
        authorize(actor, &record)?;
        if record.status == UploadStatus::Completed {
            return Err(UploadError::AlreadyCompleted(*file_key));
        }

        if let Some(&missing_index) = self.missing_for(&record).await?.first() {
            return Err(UploadError::IncompleteUpload {
                file_key: *file_key,
                missing_index,
            });
        }

        let start = Instant::now();
        let outcome = self.assemble(&record).await;
        if outcome.is_err() {
            MERGE_FAILURES.inc();
        }
        let outcome = outcome?;
        MERGE_DURATION.observe(start.elapsed().as_secs_f64());

        if let Err(e) = self.chunks.delete_all(file_key).await {
            tracing::warn!(
                file_key = %file_key,
                error = %e,
                "Failed to remove chunk files after merge; the sweeper reclaims them"
            );
        }
        if let Err(e) = self.tracker.clear(file_key).await {
            tracing::warn!(file_key = %file_key, error = %e, "Failed to clear presence set");
        }

        if let Some(declared) = record.content_hash
            && declared.to_hex() != outcome.content_hash
        {
            tracing::warn!(
                file_key = %file_key,
                declared = %declared,
                computed = %outcome.content_hash,
                "Client content hash does not match assembled artifact"
            );
        }

        UPLOADS_MERGED.inc();
        tracing::info!(
            file_key = %file_key,
            final_path = %outcome.final_path,
            final_size = outcome.final_size,
            "Upload merged"
        );
        Ok(outcome)
    }

    /// Write the artifact and flip the record to completed.
    async fn assemble(&self, record: &UploadRecord) -> UploadResult<MergeOutcome> {
        let key = ArtifactStore::artifact_key(&record.category, &record.file_key, &record.file_name);
        let mut upload = self.artifacts.create(&key).await?;
        let mut hasher = ContentHash::hasher();

        if let Err(e) = self.concatenate(record, upload.as_mut(), &mut hasher).await {
            discard(upload, &record.file_key).await;
            return Err(e);
        }

        let written = upload.bytes_written();
        if written != record.total_size {
            discard(upload, &record.file_key).await;
            return Err(UploadError::SizeMismatch {
                expected: record.total_size,
                actual: written,
            });
        }

        let final_size = upload.finish().await?;
        let content_hash = hasher.finalize().to_hex();

        let completion = UploadCompletion {
            final_path: key.clone(),
            final_size: i64::try_from(final_size).map_err(|_| {
                UploadError::InvalidRequest(format!("artifact size {final_size} exceeds i64"))
            })?,
            content_hash: content_hash.clone(),
            completed_at: OffsetDateTime::now_utc(),
        };
        if !self
            .metadata
            .complete_upload(*record.file_key.as_uuid(), &completion)
            .await?
        {
            return Err(UploadError::AlreadyCompleted(record.file_key));
        }

        Ok(MergeOutcome {
            final_path: key,
            final_size,
            content_hash,
        })
    }

    /// Stream every chunk, in ascending index order, into `upload`.
    async fn concatenate(
        &self,
        record: &UploadRecord,
        upload: &mut dyn StreamingUpload,
        hasher: &mut ContentHasher,
    ) -> UploadResult<()> {
        for index in 0..record.chunk_count {
            let mut stream = self.chunks.open(&record.file_key, index).await?;
            while let Some(piece) = stream.next().await {
                let piece = piece?;
                hasher.update(&piece);
                upload.write(piece).await?;
            }
        }
        Ok(())
    }

    /// Remove an upload and everything it stored.
    #[tracing::instrument(skip(self, actor), fields(file_key = %file_key))]
    pub async fn delete(&self, file_key: &FileKey, actor: &Actor) -> UploadResult<()> {
        let guard = self.locks.write(file_key).await;
        let result = self.delete_locked(file_key, actor).await;
        drop(guard);
        self.locks.forget(file_key);
        observe_error(&result);
        result
    }

    async fn delete_locked(&self, file_key: &FileKey, actor: &Actor) -> UploadResult<()> {
        let record = self.load(file_key).await?;
        authorize(actor, &record)?;

        // An uploading record may still have an artifact from a merge that
        // stopped between rename and status update.
        self.artifacts.remove(&record.category, file_key).await?;
        if record.status == UploadStatus::Uploading {
            self.chunks.delete_all(file_key).await?;
            self.tracker.clear(file_key).await?;
        }

        self.metadata.delete_upload(*file_key.as_uuid()).await?;

        UPLOADS_DELETED.inc();
        tracing::info!(file_key = %file_key, status = %record.status, "Upload deleted");
        Ok(())
    }

    pub async fn get_record(&self, file_key: &FileKey) -> UploadResult<UploadRecord> {
        self.load(file_key).await
    }

    /// Most recent uploads first, optionally restricted to one owner.
    pub async fn list_records(
        &self,
        owner_id: Option<&str>,
        limit: u32,
    ) -> UploadResult<Vec<UploadRecord>> {
        let rows = self.metadata.list_uploads(owner_id, limit).await?;
        rows.into_iter()
            .map(|row| row.into_record().map_err(UploadError::from))
            .collect()
    }

    pub async fn stats(&self) -> UploadResult<UploadStats> {
        Ok(self.metadata.upload_stats().await?)
    }

    /// Check the metadata store, the shared cache and both storage roots.
    pub async fn health_check(&self) -> UploadResult<()> {
        self.metadata.health_check().await?;
        self.cache.health_check().await?;
        self.chunks.health_check().await?;
        self.artifacts.health_check().await?;
        Ok(())
    }

    async fn load(&self, file_key: &FileKey) -> UploadResult<UploadRecord> {
        let row = self
            .metadata
            .get_upload(*file_key.as_uuid())
            .await?
            .ok_or(UploadError::NotFound(*file_key))?;
        Ok(row.into_record()?)
    }
}

impl Drop for UploadEngine {
    fn drop(&mut self) {
        if let Some(reaper) = self.cache_reaper.take() {
            reaper.abort();
        }
    }
}

fn authorize(actor: &Actor, record: &UploadRecord) -> UploadResult<()> {
    if actor.can_access(&record.owner_id) {
        Ok(())
    } else {
        Err(UploadError::PermissionDenied(record.file_key))
    }
}

/// Check that the declared chunk shape is self-consistent.
fn validate_shape(request: &InitRequest) -> UploadResult<()> {
    if request.file_name.trim().is_empty() {
        return Err(UploadError::InvalidRequest("file name is empty".to_string()));
    }
    if request.chunk_size == 0 || request.chunk_size > MAX_CHUNK_SIZE {
        return Err(UploadError::InvalidRequest(format!(
            "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
            request.chunk_size
        )));
    }
    if request.chunk_count == 0 || request.chunk_count > MAX_CHUNK_COUNT {
        return Err(UploadError::InvalidRequest(format!(
            "chunk count must be between 1 and {MAX_CHUNK_COUNT}, got {}",
            request.chunk_count
        )));
    }
    let implied = UploadRecord::implied_chunk_count(request.total_size, request.chunk_size);
    if u64::from(request.chunk_count) != implied {
        return Err(UploadError::InvalidRequest(format!(
            "chunk count {} does not match total size {} at chunk size {} (expected {implied})",
            request.chunk_count, request.total_size, request.chunk_size
        )));
    }
    Ok(())
}

async fn discard(upload: Box<dyn StreamingUpload>, file_key: &FileKey) {
    if let Err(e) = upload.abort().await {
        tracing::warn!(file_key = %file_key, error = %e, "Failed to discard partial artifact");
    }
}

fn observe_error<T>(result: &UploadResult<T>) {
    if let Err(e) = result {
        record_upload_error(e.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(chunk_count: u32, chunk_size: u64, total_size: u64) -> InitRequest {
        InitRequest {
            file_name: "report.pdf".to_string(),
            category: "文档".to_string(),
            chunk_count,
            chunk_size,
            total_size,
            content_hash: None,
            origin_ip: None,
        }
    }

    #[test]
    fn test_validate_shape() {
        assert!(validate_shape(&request(3, 1024, 2500)).is_ok());
        assert!(validate_shape(&request(1, 1024, 0)).is_ok());
        assert!(validate_shape(&request(1, 1024, 1024)).is_ok());

        // Count disagrees with size.
        assert!(validate_shape(&request(2, 1024, 2500)).is_err());
        assert!(validate_shape(&request(4, 1024, 2500)).is_err());
        // Degenerate values.
        assert!(validate_shape(&request(0, 1024, 0)).is_err());
        assert!(validate_shape(&request(1, 0, 0)).is_err());
        assert!(validate_shape(&request(1, MAX_CHUNK_SIZE + 1, 10)).is_err());

        let mut nameless = request(1, 1024, 10);
        nameless.file_name = "  ".to_string();
        assert!(validate_shape(&nameless).is_err());
    }

    #[test]
    fn test_authorize() {
        let now = OffsetDateTime::now_utc();
        let record = UploadRecord {
            file_key: FileKey::new(),
            file_name: "a.bin".to_string(),
            category: "其他".to_string(),
            total_size: 1,
            chunk_size: 1,
            chunk_count: 1,
            content_hash: None,
            status: UploadStatus::Uploading,
            owner_id: "alice".to_string(),
            origin_ip: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            final_path: None,
            final_size: None,
        };

        assert!(authorize(&Actor::user("alice"), &record).is_ok());
        assert!(authorize(&Actor::admin("root"), &record).is_ok());
        assert!(matches!(
            authorize(&Actor::user("mallory"), &record),
            Err(UploadError::PermissionDenied(_))
        ));
    }
}
