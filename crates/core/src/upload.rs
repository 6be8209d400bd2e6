//! Upload record types and lifecycle.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey(Uuid);

impl FileKey {
    /// Generate a new random file key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidFileKey(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey({})", self.0)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload status. Monotonic: `Completed` never reverts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Chunks are being accepted.
    Uploading,
    /// The artifact was merged into its final location.
    Completed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Check if the upload can still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role attached to an already-authenticated actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// The identity an operation is performed on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    /// Whether this actor may operate on an upload owned by `owner_id`.
    ///
    /// Owners always may; admins may act on any upload.
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.role == Role::Admin || self.id == owner_id
    }
}

/// The durable record of one upload attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Unique upload identifier.
    pub file_key: FileKey,
    /// Client-supplied file name (unsanitized).
    pub file_name: String,
    /// Category, always a member of the allowed set.
    pub category: String,
    /// Declared total size in bytes.
    pub total_size: u64,
    /// Declared size of every chunk except possibly the last.
    pub chunk_size: u64,
    /// Declared number of chunks.
    pub chunk_count: u32,
    /// Client-supplied hash until merge, server-computed afterwards.
    pub content_hash: Option<ContentHash>,
    pub status: UploadStatus,
    /// Actor that initialized the upload.
    pub owner_id: String,
    pub origin_ip: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Artifact key under the permanent root; set only when completed.
    pub final_path: Option<String>,
    /// Artifact size in bytes; set only when completed.
    pub final_size: Option<u64>,
}

impl UploadRecord {
    /// Whether the record is older than `window` as of `now`.
    pub fn is_stale(&self, now: OffsetDateTime, window: time::Duration) -> bool {
        self.created_at < now - window
    }

    /// Number of chunks the declared shape implies.
    pub fn implied_chunk_count(total_size: u64, chunk_size: u64) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        total_size.div_ceil(chunk_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_key_roundtrip() {
        let key = FileKey::new();
        let parsed = FileKey::parse(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
        assert!(FileKey::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            UploadStatus::parse("uploading").unwrap(),
            UploadStatus::Uploading
        );
        assert_eq!(
            UploadStatus::parse("completed").unwrap(),
            UploadStatus::Completed
        );
        assert!(UploadStatus::parse("committing").is_err());
        assert!(UploadStatus::Uploading.is_active());
        assert!(!UploadStatus::Completed.is_active());
    }

    #[test]
    fn test_actor_access() {
        assert!(Actor::user("alice").can_access("alice"));
        assert!(!Actor::user("bob").can_access("alice"));
        assert!(Actor::admin("root").can_access("alice"));
    }

    #[test]
    fn test_implied_chunk_count() {
        let mib = 1024 * 1024;
        assert_eq!(UploadRecord::implied_chunk_count(5 * mib / 2, mib), 3);
        assert_eq!(UploadRecord::implied_chunk_count(2 * mib, mib), 2);
        assert_eq!(UploadRecord::implied_chunk_count(0, mib), 1);
        assert_eq!(UploadRecord::implied_chunk_count(10, 0), 0);
    }
}
