//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::UploadRow;
use crate::repos::{UploadCompletion, UploadRepo, UploadStats};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store and apply the schema.
    ///
    /// `query_timeout_secs` bounds how long an operation waits for the
    /// connection; SQLite itself cannot cancel a running statement.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers, which is what makes the
            // status compare-and-swap race free.
            .max_connections(1)
            .acquire_timeout(query_timeout)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Opened SQLite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO uploads (
                file_key, file_name, category, total_size, chunk_size,
                chunk_count, content_hash, status, owner_id, origin_ip,
                created_at, updated_at, completed_at, final_path, final_size
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(upload.file_key)
        .bind(&upload.file_name)
        .bind(&upload.category)
        .bind(upload.total_size)
        .bind(upload.chunk_size)
        .bind(upload.chunk_count)
        .bind(&upload.content_hash)
        .bind(&upload.status)
        .bind(&upload.owner_id)
        .bind(&upload.origin_ip)
        .bind(upload.created_at)
        .bind(upload.updated_at)
        .bind(upload.completed_at)
        .bind(&upload.final_path)
        .bind(upload.final_size)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                MetadataError::AlreadyExists(format!("file_key {}", upload.file_key)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_upload(&self, file_key: Uuid) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE file_key = ?")
            .bind(file_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_completed_by_hash(
        &self,
        content_hash: &str,
    ) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE content_hash = ? AND status = 'completed' \
             ORDER BY completed_at, file_key LIMIT 1",
        )
        .bind(content_hash.to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn complete_upload(
        &self,
        file_key: Uuid,
        completion: &UploadCompletion,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET status = 'completed', final_path = ?, final_size = ?, \
             content_hash = ?, completed_at = ?, updated_at = ? \
             WHERE file_key = ? AND status = 'uploading'",
        )
        .bind(&completion.final_path)
        .bind(completion.final_size)
        .bind(&completion.content_hash)
        .bind(completion.completed_at)
        .bind(completion.completed_at)
        .bind(file_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_upload(&self, file_key: Uuid) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE file_key = ?")
            .bind(file_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_stale_upload(
        &self,
        file_key: Uuid,
        older_than: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "DELETE FROM uploads WHERE file_key = ? AND status = 'uploading' AND created_at < ?",
        )
        .bind(file_key)
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_stale_uploads(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE status = 'uploading' AND created_at < ? \
             ORDER BY created_at LIMIT ?",
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_uploads(
        &self,
        owner_id: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query_as::<_, UploadRow>(
                    "SELECT * FROM uploads WHERE owner_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(owner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UploadRow>(
                    "SELECT * FROM uploads ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn upload_stats(&self) -> MetadataResult<UploadStats> {
        let (uploading, completed, completed_bytes): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'uploading' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN final_size ELSE 0 END), 0)
            FROM uploads
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(UploadStats {
            uploading: uploading.max(0) as u64,
            completed: completed.max(0) as u64,
            completed_bytes: completed_bytes.max(0) as u64,
        })
    }
}

const SCHEMA_SQL: &str = r#"
-- One row per upload attempt
CREATE TABLE IF NOT EXISTS uploads (
    file_key BLOB PRIMARY KEY,
    file_name TEXT NOT NULL,
    category TEXT NOT NULL,
    total_size INTEGER NOT NULL CHECK (total_size >= 0),
    chunk_size INTEGER NOT NULL CHECK (chunk_size > 0),
    chunk_count INTEGER NOT NULL CHECK (chunk_count > 0),
    content_hash TEXT,
    status TEXT NOT NULL DEFAULT 'uploading' CHECK (status IN ('uploading', 'completed')),
    owner_id TEXT NOT NULL,
    origin_ip TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    final_path TEXT,
    final_size INTEGER,
    CHECK (status = 'uploading' OR (final_path IS NOT NULL AND final_size IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS idx_uploads_status_created ON uploads(status, created_at);
CREATE INDEX IF NOT EXISTS idx_uploads_completed_hash ON uploads(content_hash) WHERE status = 'completed';
CREATE INDEX IF NOT EXISTS idx_uploads_owner_created ON uploads(owner_id, created_at);
"#;
