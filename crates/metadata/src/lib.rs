//! Metadata store abstraction and implementations for parcel.
//!
//! This crate holds the durable upload registry: one row per upload attempt
//! with its declared shape, owner, status and final location.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::UploadRow;
pub use repos::{UploadCompletion, UploadRepo, UploadStats};
pub use store::{MetadataStore, SqliteStore};

use parcel_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
