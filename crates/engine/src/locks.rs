//! Per-upload read/write locks.
//!
//! Chunk writes on one upload share the lock; merge, delete and sweep take it
//! exclusively. Locks are process-local and only order work inside one engine
//! instance; the status compare-and-swap in the metadata store still guards
//! the completion write itself.

use dashmap::DashMap;
use parcel_core::FileKey;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Default)]
pub struct UploadLocks {
    locks: DashMap<FileKey, Arc<RwLock<()>>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, file_key: &FileKey) -> Arc<RwLock<()>> {
        self.locks.entry(*file_key).or_default().clone()
    }

    pub async fn read(&self, file_key: &FileKey) -> OwnedRwLockReadGuard<()> {
        self.lock_for(file_key).read_owned().await
    }

    pub async fn write(&self, file_key: &FileKey) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(file_key).write_owned().await
    }

    /// Take the exclusive lock only if nobody holds the upload right now.
    pub fn try_write(&self, file_key: &FileKey) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock_for(file_key).try_write_owned().ok()
    }

    /// Drop the table entry when no guard or waiter references it anymore.
    /// Call after releasing the guard.
    pub fn forget(&self, file_key: &FileKey) {
        self.locks
            .remove_if(file_key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
