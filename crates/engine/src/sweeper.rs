//! Periodic removal of abandoned uploads.

use crate::chunk_store::{ArtifactStore, ChunkStore};
use crate::error::UploadResult;
use crate::locks::UploadLocks;
use crate::metrics::SWEEP_ITEMS_DELETED;
use crate::tracker::ChunkTracker;
use parcel_core::FileKey;
use parcel_core::config::SweeperConfig;
use parcel_metadata::MetadataStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Statistics from one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Stale uploads examined.
    pub items_processed: u64,
    /// Stale uploads removed.
    pub items_deleted: u64,
    /// Chunk directories removed because no upload owned them.
    pub orphans_deleted: u64,
    pub errors: u64,
}

/// Removes uploads left `Uploading` past the staleness window, along with
/// their chunk files, presence sets and any artifact an interrupted merge
/// left behind. Completed uploads are never touched.
pub struct ExpirySweeper {
    metadata: Arc<dyn MetadataStore>,
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    tracker: ChunkTracker,
    locks: Arc<UploadLocks>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        tracker: ChunkTracker,
        locks: Arc<UploadLocks>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            metadata,
            chunks,
            artifacts,
            tracker,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run one sweep.
    ///
    /// Uploads busy with a chunk write, merge or delete are skipped and picked
    /// up by a later run.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> UploadResult<SweepStats> {
        let cutoff = OffsetDateTime::now_utc() - self.config.stale_after();
        let mut stats = SweepStats::default();
        // Rows that stay in the stale set after this run looked at them.
        let mut passed: HashSet<FileKey> = HashSet::new();
        let mut iterations = 0u64;

        loop {
            iterations += 1;
            if iterations > self.config.max_iterations {
                tracing::warn!(
                    iterations,
                    max_iterations = self.config.max_iterations,
                    "Expiry sweep exceeded max iterations, stopping to prevent infinite loop"
                );
                break;
            }

            let stale = self
                .metadata
                .get_stale_uploads(cutoff, self.config.batch_size)
                .await?;
            let batch: Vec<(FileKey, String)> = stale
                .into_iter()
                .map(|row| (FileKey::from_uuid(row.file_key), row.category))
                .filter(|(key, _)| !passed.contains(key))
                .collect();
            if batch.is_empty() {
                break;
            }

            for (file_key, category) in batch {
                stats.items_processed += 1;

                let Some(guard) = self.locks.try_write(&file_key) else {
                    tracing::debug!(file_key = %file_key, "Stale upload busy, skipping");
                    passed.insert(file_key);
                    continue;
                };
                let result = self.sweep_upload(&file_key, &category, cutoff).await;
                drop(guard);
                self.locks.forget(&file_key);

                match result {
                    Ok(true) => {
                        stats.items_deleted += 1;
                        SWEEP_ITEMS_DELETED.with_label_values(&["upload"]).inc();
                        tracing::debug!(file_key = %file_key, "Stale upload removed");
                    }
                    Ok(false) => {
                        passed.insert(file_key);
                    }
                    Err(e) => {
                        tracing::error!(
                            file_key = %file_key,
                            error = %e,
                            "Failed to remove stale upload"
                        );
                        stats.errors += 1;
                        passed.insert(file_key);
                    }
                }
            }
        }

        if self.config.sweep_orphaned_chunks {
            self.sweep_orphans(&mut stats).await?;
        }

        tracing::info!(
            items_processed = stats.items_processed,
            items_deleted = stats.items_deleted,
            orphans_deleted = stats.orphans_deleted,
            errors = stats.errors,
            "Expiry sweep finished"
        );
        Ok(stats)
    }

    /// Remove one stale upload. Returns `false` if it completed or vanished
    /// since it was selected.
    async fn sweep_upload(
        &self,
        file_key: &FileKey,
        category: &str,
        cutoff: OffsetDateTime,
    ) -> UploadResult<bool> {
        // The row goes first; chunk files left by a failure below are
        // collected as orphans.
        if !self
            .metadata
            .delete_stale_upload(*file_key.as_uuid(), cutoff)
            .await?
        {
            return Ok(false);
        }
        // A merge that stopped between the rename and the status update
        // leaves a full artifact under an uploading row.
        let removed = self.artifacts.remove(category, file_key).await?;
        if removed > 0 {
            tracing::info!(
                file_key = %file_key,
                category,
                "Removed artifact of an unfinished merge"
            );
        }
        self.chunks.delete_all(file_key).await?;
        self.tracker.clear(file_key).await?;
        Ok(true)
    }

    /// Remove chunk directories whose upload no longer exists.
    async fn sweep_orphans(&self, stats: &mut SweepStats) -> UploadResult<()> {
        for file_key in self.chunks.list_file_keys().await? {
            let Some(guard) = self.locks.try_write(&file_key) else {
                continue;
            };
            let result = self.sweep_orphan(&file_key).await;
            drop(guard);
            self.locks.forget(&file_key);

            match result {
                Ok(true) => {
                    stats.orphans_deleted += 1;
                    SWEEP_ITEMS_DELETED.with_label_values(&["orphan"]).inc();
                    tracing::debug!(file_key = %file_key, "Orphaned chunk directory removed");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        file_key = %file_key,
                        error = %e,
                        "Failed to remove orphaned chunk directory"
                    );
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn sweep_orphan(&self, file_key: &FileKey) -> UploadResult<bool> {
        if self.metadata.get_upload(*file_key.as_uuid()).await?.is_some() {
            return Ok(false);
        }
        self.chunks.delete_all(file_key).await?;
        self.tracker.clear(file_key).await?;
        Ok(true)
    }

    /// Run a sweep every `interval` until `cancel` fires. The first sweep
    /// runs immediately.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.config.interval_secs,
                stale_after_secs = self.config.stale_after_secs,
                "Expiry sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Expiry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }
        })
    }
}
