//! Per-upload record of which chunk indices have been durably written.

use crate::error::UploadResult;
use parcel_cache::SharedCache;
use parcel_core::FileKey;
use std::sync::Arc;
use std::time::Duration;

/// Chunk presence sets kept in the shared cache.
///
/// Every add re-arms the TTL, so a set only expires once its upload has been
/// idle for the whole window. A missing set is not authoritative: callers fall
/// back to the chunk files on disk.
#[derive(Clone)]
pub struct ChunkTracker {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl ChunkTracker {
    pub fn new(cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Cache key of the presence set for an upload.
    pub fn presence_key(file_key: &FileKey) -> String {
        format!("upload:chunks:{file_key}")
    }

    /// Start an empty set for a new upload.
    pub async fn init(&self, file_key: &FileKey) -> UploadResult<()> {
        self.cache
            .set_init(&Self::presence_key(file_key), self.ttl)
            .await?;
        Ok(())
    }

    /// Mark an index as present. Returns `true` the first time it is added.
    pub async fn mark(&self, file_key: &FileKey, index: u32) -> UploadResult<bool> {
        Ok(self
            .cache
            .set_add(&Self::presence_key(file_key), index, self.ttl)
            .await?)
    }

    pub async fn contains(&self, file_key: &FileKey, index: u32) -> UploadResult<bool> {
        Ok(self
            .cache
            .set_contains(&Self::presence_key(file_key), index)
            .await?)
    }

    /// Whether a set exists for the upload at all.
    pub async fn is_tracked(&self, file_key: &FileKey) -> UploadResult<bool> {
        Ok(self.cache.exists(&Self::presence_key(file_key)).await?)
    }

    pub async fn received_count(&self, file_key: &FileKey) -> UploadResult<usize> {
        Ok(self.cache.set_len(&Self::presence_key(file_key)).await?)
    }

    /// Received indices in ascending order.
    pub async fn received(&self, file_key: &FileKey) -> UploadResult<Vec<u32>> {
        Ok(self
            .cache
            .set_members(&Self::presence_key(file_key))
            .await?)
    }

    /// Indices in `0..chunk_count` not yet received, ascending.
    pub async fn missing(&self, file_key: &FileKey, chunk_count: u32) -> UploadResult<Vec<u32>> {
        let received = self.received(file_key).await?;
        Ok(missing_indices(received.iter().copied(), chunk_count))
    }

    /// Drop the set. Returns `true` if one existed.
    pub async fn clear(&self, file_key: &FileKey) -> UploadResult<bool> {
        Ok(self.cache.delete(&Self::presence_key(file_key)).await?)
    }
}

/// Indices in `0..chunk_count` absent from `present`. Out-of-range members
/// are ignored.
pub(crate) fn missing_indices(present: impl IntoIterator<Item = u32>, chunk_count: u32) -> Vec<u32> {
    let mut seen = vec![false; chunk_count as usize];
    for index in present {
        if let Some(slot) = seen.get_mut(index as usize) {
            *slot = true;
        }
    }
    seen.iter()
        .enumerate()
        .filter(|(_, present)| !**present)
        .map(|(index, _)| index as u32)
        .collect()
}
