//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::Duration;

/// Upload engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum declared total size of a single upload, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum chunk writes in flight for one upload.
    #[serde(default = "default_max_concurrent_chunk_writes")]
    pub max_concurrent_chunk_writes: u32,
    /// Lifetime of a concurrency slot counter. A client that vanishes
    /// mid-write releases its slot once this elapses.
    #[serde(default = "default_slot_ttl_secs")]
    pub slot_ttl_secs: u64,
    /// Lifetime of a chunk presence set, refreshed on every chunk write.
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,
    /// Categories an upload may be filed under.
    #[serde(default = "default_allowed_categories")]
    pub allowed_categories: Vec<String>,
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_max_concurrent_chunk_writes() -> u32 {
    3
}

fn default_slot_ttl_secs() -> u64 {
    60
}

fn default_presence_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_allowed_categories() -> Vec<String> {
    ["开发工具", "文档", "图片", "视频", "音频", "其他"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_concurrent_chunk_writes: default_max_concurrent_chunk_writes(),
            slot_ttl_secs: default_slot_ttl_secs(),
            presence_ttl_secs: default_presence_ttl_secs(),
            allowed_categories: default_allowed_categories(),
        }
    }
}

impl EngineConfig {
    pub fn slot_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.slot_ttl_secs)
    }

    pub fn presence_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_file_size == 0 {
            return Err("engine.max_file_size must be greater than 0".to_string());
        }
        if self.max_concurrent_chunk_writes == 0 {
            return Err(
                "engine.max_concurrent_chunk_writes must be at least 1; \
                 0 would reject every chunk"
                    .to_string(),
            );
        }
        // A zero TTL would let slots and presence sets vanish immediately.
        if self.slot_ttl_secs == 0 {
            return Err("engine.slot_ttl_secs cannot be 0".to_string());
        }
        if self.presence_ttl_secs == 0 {
            return Err("engine.presence_ttl_secs cannot be 0".to_string());
        }
        if self.allowed_categories.is_empty() {
            return Err("engine.allowed_categories cannot be empty".to_string());
        }
        crate::CategorySet::new(self.allowed_categories.iter().cloned())
            .map(|_| ())
            .map_err(|e| format!("engine.allowed_categories: {e}"))
    }
}

/// File surface configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for per-upload chunk files.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// Root for merged artifacts.
    #[serde(default = "default_final_root")]
    pub final_root: PathBuf,
}

fn default_temp_root() -> PathBuf {
    PathBuf::from("./data/chunks")
}

fn default_final_root() -> PathBuf {
    PathBuf::from("./data/files")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            final_root: default_final_root(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.temp_root.as_os_str().is_empty() || self.final_root.as_os_str().is_empty() {
            return Err("storage.temp_root and storage.final_root must be set".to_string());
        }
        // The sweeper treats every top-level directory under temp_root as an
        // upload, so the two roots must not overlap.
        if self.final_root.starts_with(&self.temp_root)
            || self.temp_root.starts_with(&self.final_root)
        {
            return Err(format!(
                "storage.temp_root ({}) and storage.final_root ({}) must not be nested",
                self.temp_root.display(),
                self.final_root.display()
            ));
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Path to the database file.
        path: PathBuf,
        /// Query timeout in seconds (advisory, SQLite has no server-side timeout).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path cannot be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Expiry sweeper configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper periodically (default: true).
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    /// Seconds between sweeps (default: daily).
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Uploads still in progress after this many seconds are purged.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Records fetched per batch.
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: u32,
    /// Upper bound on batches per run. Remaining work waits for the next run.
    #[serde(default = "default_max_sweep_iterations")]
    pub max_iterations: u64,
    /// Also remove chunk directories that have no registry row.
    #[serde(default = "default_sweep_orphaned_chunks")]
    pub sweep_orphaned_chunks: bool,
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    86400 // daily
}

fn default_stale_after_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_batch_size() -> u32 {
    500
}

fn default_max_sweep_iterations() -> u64 {
    1000
}

fn default_sweep_orphaned_chunks() -> bool {
    true
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            batch_size: default_sweep_batch_size(),
            max_iterations: default_max_sweep_iterations(),
            sweep_orphaned_chunks: default_sweep_orphaned_chunks(),
        }
    }
}

impl SweeperConfig {
    /// Staleness window as a Duration.
    pub fn stale_after(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        // tokio::time::interval panics on a zero period.
        if self.interval_secs == 0 {
            return Err("sweeper.interval_secs cannot be 0".to_string());
        }
        if self.stale_after_secs == 0 {
            return Err(
                "sweeper.stale_after_secs cannot be 0; every in-progress upload \
                 would be purged"
                    .to_string(),
            );
        }
        if self.batch_size == 0 {
            return Err("sweeper.batch_size must be greater than 0".to_string());
        }
        if self.max_iterations == 0 {
            return Err("sweeper.max_iterations must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// In-process shared cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds between expired-entry reaper passes.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cleanup_interval_secs == 0 {
            return Err("cache.cleanup_interval_secs cannot be 0. \
                 Use a value >= 1 second."
                .to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.sweeper.validate()?;
        self.cache.validate()?;
        Ok(())
    }

    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** Uses a SQLite database and two storage roots
    /// inside the given directory.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            engine: EngineConfig::default(),
            storage: StorageConfig {
                temp_root: root.join("chunks"),
                final_root: root.join("files"),
            },
            metadata: MetadataConfig::Sqlite {
                path: root.join("metadata.db"),
                query_timeout_secs: default_sqlite_query_timeout_secs(),
            },
            sweeper: SweeperConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}
