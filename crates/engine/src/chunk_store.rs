//! Chunk payload and artifact placement on the file surface.

use bytes::Bytes;
use parcel_core::{FileKey, sanitize_file_name};
use parcel_storage::{ByteStream, ObjectStore, StorageResult, StreamingUpload};
use std::collections::BTreeSet;
use std::sync::Arc;

const CHUNK_SUFFIX: &str = ".part";

/// Per-upload chunk files under the temp root, addressed by
/// `(fileKey, chunkIndex)` as `{fileKey}/{index}.part`.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Key of one chunk file.
    pub fn chunk_key(file_key: &FileKey, index: u32) -> String {
        format!("{file_key}/{index}{CHUNK_SUFFIX}")
    }

    fn upload_prefix(file_key: &FileKey) -> String {
        file_key.to_string()
    }

    /// Parse `{fileKey}/{index}.part` back into an index, ignoring temp files
    /// and anything else that is not a chunk.
    fn parse_index(file_key: &FileKey, key: &str) -> Option<u32> {
        let rest = key.strip_prefix(&Self::upload_prefix(file_key))?;
        let name = rest.strip_prefix('/')?;
        let digits = name.strip_suffix(CHUNK_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Write (or overwrite) a chunk payload atomically.
    pub async fn put(&self, file_key: &FileKey, index: u32, data: Bytes) -> StorageResult<()> {
        self.store.put(&Self::chunk_key(file_key, index), data).await
    }

    pub async fn exists(&self, file_key: &FileKey, index: u32) -> StorageResult<bool> {
        self.store.exists(&Self::chunk_key(file_key, index)).await
    }

    /// Open a chunk for streaming reads.
    pub async fn open(&self, file_key: &FileKey, index: u32) -> StorageResult<ByteStream> {
        self.store
            .get_stream(&Self::chunk_key(file_key, index))
            .await
    }

    /// Indices that have a chunk file on disk.
    pub async fn present_indices(&self, file_key: &FileKey) -> StorageResult<BTreeSet<u32>> {
        let keys = self.store.list(&Self::upload_prefix(file_key)).await?;
        Ok(keys
            .iter()
            .filter_map(|key| Self::parse_index(file_key, key))
            .collect())
    }

    /// Remove every chunk file of an upload. Returns the number of files removed.
    pub async fn delete_all(&self, file_key: &FileKey) -> StorageResult<u64> {
        self.store.delete_prefix(&Self::upload_prefix(file_key)).await
    }

    /// Upload directories present under the temp root. Entries that are not
    /// file keys are left alone.
    pub async fn list_file_keys(&self) -> StorageResult<BTreeSet<FileKey>> {
        let keys = self.store.list("").await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.split('/').next())
            .filter_map(|dir| FileKey::parse(dir).ok())
            .collect())
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.store.health_check().await
    }
}

/// Merged artifacts under the permanent root, addressed by
/// `{category}/{fileKey}/{sanitizedFileName}`.
///
/// The file key segment keeps two uploads with the same name apart; the
/// sanitized name keeps the path inside the category directory.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn artifact_key(category: &str, file_key: &FileKey, file_name: &str) -> String {
        format!("{category}/{file_key}/{}", sanitize_file_name(file_name))
    }

    fn artifact_dir(category: &str, file_key: &FileKey) -> String {
        format!("{category}/{file_key}")
    }

    /// Begin writing an artifact; nothing is visible until the upload finishes.
    pub async fn create(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.store.put_stream(key).await
    }

    pub async fn read(&self, key: &str) -> StorageResult<Bytes> {
        self.store.get(key).await
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.store.exists(key).await
    }

    /// Remove the artifact directory of an upload.
    pub async fn remove(&self, category: &str, file_key: &FileKey) -> StorageResult<u64> {
        self.store
            .delete_prefix(&Self::artifact_dir(category, file_key))
            .await
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_storage::FilesystemBackend;

    async fn chunk_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, ChunkStore::new(Arc::new(backend)))
    }

    #[test]
    fn test_keys() {
        let key = FileKey::parse("6f1c2a9e-3b7d-4c1e-9a8f-2d4b6c8e0f1a").unwrap();
        assert_eq!(
            ChunkStore::chunk_key(&key, 12),
            "6f1c2a9e-3b7d-4c1e-9a8f-2d4b6c8e0f1a/12.part"
        );
        assert_eq!(
            ArtifactStore::artifact_key("开发工具", &key, "../../report.pdf"),
            "开发工具/6f1c2a9e-3b7d-4c1e-9a8f-2d4b6c8e0f1a/report.pdf"
        );
    }

    #[test]
    fn test_parse_index() {
        let key = FileKey::new();
        let k = key.to_string();
        assert_eq!(ChunkStore::parse_index(&key, &format!("{k}/3.part")), Some(3));
        assert_eq!(
            ChunkStore::parse_index(&key, &format!("{k}/3.part.tmp.abc")),
            None
        );
        assert_eq!(ChunkStore::parse_index(&key, &format!("{k}/x.part")), None);
        assert_eq!(ChunkStore::parse_index(&key, &format!("{k}/-1.part")), None);
        assert_eq!(ChunkStore::parse_index(&key, "other/3.part"), None);
    }

    #[tokio::test]
    async fn test_put_overwrite_and_list() {
        let (_dir, store) = chunk_store().await;
        let key = FileKey::new();

        store.put(&key, 2, Bytes::from("old")).await.unwrap();
        store.put(&key, 0, Bytes::from("zero")).await.unwrap();
        store.put(&key, 2, Bytes::from("new")).await.unwrap();

        assert!(store.exists(&key, 2).await.unwrap());
        assert!(!store.exists(&key, 1).await.unwrap());
        assert_eq!(
            store.present_indices(&key).await.unwrap(),
            BTreeSet::from([0, 2])
        );
        assert_eq!(store.list_file_keys().await.unwrap(), BTreeSet::from([key]));

        assert_eq!(store.delete_all(&key).await.unwrap(), 2);
        assert!(store.present_indices(&key).await.unwrap().is_empty());
        assert!(store.list_file_keys().await.unwrap().is_empty());
    }
}
