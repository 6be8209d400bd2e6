//! Core domain types and shared logic for the parcel upload engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload identifiers, status and records
//! - Actors and the ownership capability check
//! - Allowed categories and file-name sanitization
//! - Content hashing
//! - Configuration

pub mod category;
pub mod config;
pub mod error;
pub mod hash;
pub mod upload;

pub use category::{CategorySet, sanitize_file_name};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use upload::{Actor, FileKey, Role, UploadRecord, UploadStatus};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size accepted at initialization: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum number of chunks a single upload may declare.
pub const MAX_CHUNK_COUNT: u32 = 100_000;
