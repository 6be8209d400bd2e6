//! Metadata store test utilities.

use parcel_metadata::{MetadataResult, MetadataStore, SqliteStore, UploadRow};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a new test metadata store backed by a temp-dir SQLite file.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path, None).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// An in-progress upload row created `age` ago.
pub fn uploading_row(owner: &str, age: time::Duration) -> UploadRow {
    let created_at = OffsetDateTime::now_utc() - age;
    UploadRow {
        file_key: Uuid::new_v4(),
        file_name: "report.pdf".to_string(),
        category: "文档".to_string(),
        total_size: 2_621_440,
        chunk_size: 1_048_576,
        chunk_count: 3,
        content_hash: None,
        status: "uploading".to_string(),
        owner_id: owner.to_string(),
        origin_ip: Some("127.0.0.1".to_string()),
        created_at,
        updated_at: created_at,
        completed_at: None,
        final_path: None,
        final_size: None,
    }
}
