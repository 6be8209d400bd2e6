//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use parcel_core::{ContentHash, FileKey, UploadRecord, UploadStatus};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Upload record row.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub file_key: Uuid,
    pub file_name: String,
    pub category: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub chunk_count: i64,
    pub content_hash: Option<String>,
    pub status: String,
    pub owner_id: String,
    pub origin_ip: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub final_path: Option<String>,
    pub final_size: Option<i64>,
}

impl UploadRow {
    /// Build a row from a domain record.
    pub fn from_record(record: &UploadRecord) -> MetadataResult<Self> {
        let to_i64 = |field: &str, value: u64| {
            i64::try_from(value).map_err(|_| MetadataError::InvalidRow {
                file_key: record.file_key.to_string(),
                reason: format!("{field} {value} exceeds i64"),
            })
        };

        Ok(Self {
            file_key: *record.file_key.as_uuid(),
            file_name: record.file_name.clone(),
            category: record.category.clone(),
            total_size: to_i64("total_size", record.total_size)?,
            chunk_size: to_i64("chunk_size", record.chunk_size)?,
            chunk_count: i64::from(record.chunk_count),
            content_hash: record.content_hash.map(|h| h.to_hex()),
            status: record.status.as_str().to_string(),
            owner_id: record.owner_id.clone(),
            origin_ip: record.origin_ip.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
            final_path: record.final_path.clone(),
            final_size: record.final_size.map(|s| to_i64("final_size", s)).transpose()?,
        })
    }

    /// Convert into a domain record, rejecting rows that violate its invariants.
    pub fn into_record(self) -> MetadataResult<UploadRecord> {
        let key = self.file_key.to_string();
        let invalid = |reason: String| MetadataError::InvalidRow {
            file_key: key.clone(),
            reason,
        };

        let status = UploadStatus::parse(&self.status).map_err(|e| invalid(e.to_string()))?;
        let content_hash = self
            .content_hash
            .as_deref()
            .map(ContentHash::from_hex)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        let to_u64 = |field: &str, value: i64| {
            u64::try_from(value).map_err(|_| invalid(format!("negative {field}: {value}")))
        };
        let chunk_count = u32::try_from(self.chunk_count)
            .map_err(|_| invalid(format!("chunk_count out of range: {}", self.chunk_count)))?;

        if status == UploadStatus::Completed && self.final_path.is_none() {
            return Err(invalid("completed upload without final_path".to_string()));
        }

        Ok(UploadRecord {
            file_key: FileKey::from_uuid(self.file_key),
            file_name: self.file_name,
            category: self.category,
            total_size: to_u64("total_size", self.total_size)?,
            chunk_size: to_u64("chunk_size", self.chunk_size)?,
            chunk_count,
            content_hash,
            status,
            owner_id: self.owner_id,
            origin_ip: self.origin_ip,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            final_path: self.final_path,
            final_size: self.final_size.map(|s| to_u64("final_size", s)).transpose()?,
        })
    }
}
