//! Per-upload bound on simultaneous chunk writes.

use crate::error::{UploadError, UploadResult};
use crate::metrics::CHUNKS_REJECTED_BY_GATE;
use parcel_cache::SharedCache;
use parcel_core::FileKey;
use std::sync::Arc;
use std::time::Duration;

/// Bounds in-flight chunk writes per upload with a counter in the shared
/// cache.
///
/// A slot is taken with a conditional increment, so a rejected attempt
/// neither changes the counter nor extends its TTL. Accepted attempts re-arm
/// the TTL; once no write is accepted for that long, slots leaked by a
/// crashed process free themselves.
#[derive(Clone)]
pub struct ConcurrencyGate {
    cache: Arc<dyn SharedCache>,
    max: u32,
    ttl: Duration,
}

/// A held slot.
///
/// Hand it back with [`SlotPermit::release`] (or
/// [`ConcurrencyGate::release`]). A permit dropped without release, e.g.
/// when the request future is cancelled mid-write, releases its slot from a
/// spawned task.
#[must_use = "dropping a permit releases its slot"]
pub struct SlotPermit {
    file_key: FileKey,
    cache: Arc<dyn SharedCache>,
    released: bool,
    runtime_handle: Option<tokio::runtime::Handle>,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("file_key", &self.file_key)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotPermit {
    pub fn file_key(&self) -> &FileKey {
        &self.file_key
    }

    /// Give the slot back. Never fails: a release the cache refuses is left
    /// to the TTL.
    pub async fn release(mut self) {
        self.released = true;
        release_slot(self.cache.as_ref(), &self.file_key).await;
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let cache = self.cache.clone();
        let file_key = self.file_key;
        if let Some(ref handle) = self.runtime_handle {
            handle.spawn(async move {
                release_slot(cache.as_ref(), &file_key).await;
                tracing::debug!(file_key = %file_key, "Released slot of an abandoned chunk write");
            });
        } else {
            tracing::warn!(
                file_key = %file_key,
                "Slot permit dropped without a runtime; the slot expires with its TTL"
            );
        }
    }
}

async fn release_slot(cache: &dyn SharedCache, file_key: &FileKey) {
    if let Err(e) = cache.decr(&ConcurrencyGate::slot_key(file_key)).await {
        tracing::warn!(
            file_key = %file_key,
            error = %e,
            "Failed to release concurrency slot; it expires with its TTL"
        );
    }
}

impl ConcurrencyGate {
    pub fn new(cache: Arc<dyn SharedCache>, max: u32, ttl: Duration) -> Self {
        Self { cache, max, ttl }
    }

    /// Cache key of the slot counter for an upload.
    pub fn slot_key(file_key: &FileKey) -> String {
        format!("upload:slots:{file_key}")
    }

    pub fn limit(&self) -> u32 {
        self.max
    }

    /// Take a slot, or fail with `TooManyConcurrentUploads` when the limit is
    /// already reached.
    pub async fn acquire(&self, file_key: &FileKey) -> UploadResult<SlotPermit> {
        let key = Self::slot_key(file_key);
        let taken = self
            .cache
            .incr_below(&key, i64::from(self.max), self.ttl)
            .await?;

        if taken.is_none() {
            CHUNKS_REJECTED_BY_GATE.inc();
            tracing::debug!(
                file_key = %file_key,
                limit = self.max,
                "Chunk write rejected by concurrency gate"
            );
            return Err(UploadError::TooManyConcurrentUploads {
                file_key: *file_key,
                limit: self.max,
            });
        }

        Ok(SlotPermit {
            file_key: *file_key,
            cache: self.cache.clone(),
            released: false,
            runtime_handle: tokio::runtime::Handle::try_current().ok(),
        })
    }

    /// Give a slot back.
    pub async fn release(&self, permit: SlotPermit) {
        permit.release().await;
    }

    /// Number of slots currently held for an upload.
    pub async fn in_flight(&self, file_key: &FileKey) -> UploadResult<u32> {
        let value = self.cache.counter(&Self::slot_key(file_key)).await?;
        Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
    }
}
