use async_trait::async_trait;
use bytes::Bytes;
use parcel_storage::{ByteStream, ObjectMeta, ObjectStore, StorageResult, StreamingUpload};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Backend wrapper whose `put` calls block until [`HeldWrites::release_all`],
/// so chunk writes stay in flight for as long as a test needs.
pub struct HeldWrites {
    inner: Arc<dyn ObjectStore>,
    hold: Semaphore,
    entered: AtomicUsize,
}

impl HeldWrites {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            hold: Semaphore::new(0),
            entered: AtomicUsize::new(0),
        })
    }

    /// Number of `put` calls that have started.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Let every held and future `put` through.
    pub fn release_all(&self) {
        self.hold.close();
    }
}

#[async_trait]
impl ObjectStore for HeldWrites {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        // A closed semaphore refuses every acquire; that is the release signal.
        let _ = self.hold.acquire().await;
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        self.inner.delete_prefix(prefix).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "held-writes"
    }
}
