//! File surface abstraction and backends for parcel.
//!
//! This crate provides:
//! - Atomic whole-object writes (temp file, fsync, rename)
//! - Streaming writes that only become visible on `finish`
//! - Prefix listing and prefix deletion
//! - A local filesystem backend with path traversal protection

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::{FilesystemBackend, TEMP_MARKER};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use parcel_core::config::StorageConfig;
use std::sync::Arc;

/// The two storage roots an engine works with.
#[derive(Clone)]
pub struct StorageRoots {
    /// Per-upload chunk files.
    pub chunks: Arc<dyn ObjectStore>,
    /// Merged artifacts.
    pub artifacts: Arc<dyn ObjectStore>,
}

/// Create both storage roots from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<StorageRoots> {
    config.validate().map_err(StorageError::Config)?;

    let chunks = FilesystemBackend::new(&config.temp_root).await?;
    let artifacts = FilesystemBackend::new(&config.final_root).await?;
    Ok(StorageRoots {
        chunks: Arc::new(chunks),
        artifacts: Arc::new(artifacts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig {
            temp_root: temp.path().join("chunks"),
            final_root: temp.path().join("files"),
        };

        let roots = from_config(&config).await.unwrap();
        roots
            .chunks
            .put("k/0.part", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(roots.chunks.exists("k/0.part").await.unwrap());
        assert!(!roots.artifacts.exists("k/0.part").await.unwrap());
        roots.artifacts.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_rejects_nested_roots() {
        let temp = tempdir().unwrap();
        let config = StorageConfig {
            temp_root: temp.path().to_path_buf(),
            final_root: temp.path().join("files"),
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
