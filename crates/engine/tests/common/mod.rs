//! Engine test harness.

#![allow(dead_code)]

pub mod fixtures;
pub mod mocks;

use parcel_cache::MemoryCache;
use parcel_core::config::{EngineConfig, SweeperConfig};
use parcel_core::{Actor, FileKey};
use parcel_engine::{ExpirySweeper, InitRequest, UploadEngine};
use parcel_metadata::{MetadataStore, SqliteStore};
use parcel_storage::{FilesystemBackend, ObjectStore, StorageRoots};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;

pub const MIB: u64 = 1024 * 1024;

/// An engine over a temp-dir SQLite file, an in-process cache and two
/// filesystem roots. Everything is removed on drop.
pub struct TestEngine {
    pub engine: UploadEngine,
    pub sqlite: Arc<SqliteStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub cache: Arc<MemoryCache>,
    pub chunks: Arc<dyn ObjectStore>,
    pub artifacts: Arc<dyn ObjectStore>,
    _temp_dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::with_chunk_store(config, |chunks| chunks).await
    }

    /// Like [`TestEngine::with_config`], with the engine's chunk root wrapped
    /// by `wrap`. `self.chunks` stays the unwrapped filesystem root.
    pub async fn with_chunk_store(
        config: EngineConfig,
        wrap: impl FnOnce(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .expect("Failed to open metadata store"),
        );
        let chunks: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("chunks"))
                .await
                .expect("Failed to create chunk root"),
        );
        let artifacts: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("files"))
                .await
                .expect("Failed to create artifact root"),
        );
        let cache = Arc::new(MemoryCache::new());
        let metadata: Arc<dyn MetadataStore> = sqlite.clone();

        let engine = UploadEngine::new(
            config,
            metadata.clone(),
            cache.clone(),
            StorageRoots {
                chunks: wrap(chunks.clone()),
                artifacts: artifacts.clone(),
            },
        )
        .expect("Failed to build engine");

        Self {
            engine,
            sqlite,
            metadata,
            cache,
            chunks,
            artifacts,
            _temp_dir: temp_dir,
        }
    }

    pub fn sweeper(&self, stale_after_secs: u64) -> ExpirySweeper {
        self.engine.sweeper(SweeperConfig {
            stale_after_secs,
            batch_size: 2,
            ..SweeperConfig::default()
        })
    }

    /// Initialize an upload of `data` split at `chunk_size`.
    pub async fn init_for(
        &self,
        data: &[u8],
        chunk_size: u64,
        owner: &Actor,
    ) -> FileKey {
        let outcome = self
            .engine
            .initialize(fixtures::init_request("payload.bin", data, chunk_size), owner)
            .await
            .expect("initialize failed");
        assert!(!outcome.deduplicated);
        outcome.file_key
    }

    /// Send every chunk of `data` in index order.
    pub async fn send_all(&self, key: &FileKey, data: &[u8], chunk_size: u64, owner: &Actor) {
        for (index, chunk) in fixtures::split_into_chunks(data, chunk_size)
            .into_iter()
            .enumerate()
        {
            self.engine
                .accept_chunk(key, index as u32, chunk, owner)
                .await
                .expect("accept_chunk failed");
        }
    }

    /// Move an upload's creation time into the past.
    pub async fn age_upload(&self, key: &FileKey, age: time::Duration) {
        let created_at = OffsetDateTime::now_utc() - age;
        sqlx::query("UPDATE uploads SET created_at = ? WHERE file_key = ?")
            .bind(created_at)
            .bind(*key.as_uuid())
            .execute(self.sqlite.pool())
            .await
            .expect("Failed to age upload");
    }

    /// Read a merged artifact by its final path.
    pub async fn artifact(&self, final_path: &str) -> Vec<u8> {
        self.artifacts
            .get(final_path)
            .await
            .expect("artifact missing")
            .to_vec()
    }
}

pub fn owner() -> Actor {
    Actor::user("alice")
}

pub fn stranger() -> Actor {
    Actor::user("mallory")
}

/// A request template for tests that tweak one field.
pub fn request(category: &str, total_size: u64, chunk_size: u64) -> InitRequest {
    InitRequest {
        file_name: "report.pdf".to_string(),
        category: category.to_string(),
        chunk_count: total_size.div_ceil(chunk_size).max(1) as u32,
        chunk_size,
        total_size,
        content_hash: None,
        origin_ip: Some("127.0.0.1".to_string()),
    }
}
