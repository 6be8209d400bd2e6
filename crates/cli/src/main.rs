//! Command-line driver for the parcel upload engine.
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use parcel_core::config::AppConfig;
use parcel_core::{Actor, ContentHash, DEFAULT_CHUNK_SIZE, FileKey, Role, UploadRecord};
use parcel_engine::{InitRequest, UploadEngine, UploadError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Attempts per chunk when the engine reports a retryable failure.
const CHUNK_ATTEMPTS: u32 = 5;

#[derive(Parser)]
#[command(name = "parcel")]
#[command(about = "Resumable chunked uploads")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, env = "PARCEL_CONFIG", default_value = "config/parcel.toml")]
    config: String,

    #[command(flatten)]
    actor: ActorArgs,

    /// Print Prometheus metrics to stderr when the command finishes
    #[arg(long, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ActorArgs {
    /// Identity the command acts as
    #[arg(long = "actor", env = "PARCEL_ACTOR", default_value = "local")]
    id: String,

    /// Act with the administrator role
    #[arg(long, default_value_t = false)]
    admin: bool,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        if self.admin {
            Actor::admin(&self.id)
        } else {
            Actor::user(&self.id)
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new upload
    Init {
        /// File name recorded for the upload
        file_name: String,
        #[arg(long)]
        category: String,
        /// Total size in bytes
        #[arg(long)]
        total_size: u64,
        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// Chunk count (derived from the sizes when omitted)
        #[arg(long)]
        chunk_count: Option<u32>,
        /// MD5 of the whole file, hex encoded
        #[arg(long)]
        content_hash: Option<String>,
        #[arg(long)]
        origin_ip: Option<String>,
    },
    /// Send one chunk read from a file
    PutChunk {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
        index: u32,
        /// File holding the chunk payload
        path: PathBuf,
    },
    /// Check whether a chunk has been received
    Exists {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
        index: u32,
    },
    /// List chunk indices still to be sent
    Missing {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
    },
    /// Assemble a complete upload into its final artifact
    Merge {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
    },
    /// Delete an upload and everything it stored
    Delete {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
    },
    /// Show an upload record
    Show {
        #[arg(value_parser = parse_file_key)]
        file_key: FileKey,
    },
    /// List upload records, newest first
    List {
        /// Include every owner's uploads (administrators only)
        #[arg(long, default_value_t = false)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Upload counts and completed bytes
    Stats,
    /// Upload a local file end to end, skipping chunks already received
    Upload {
        path: PathBuf,
        #[arg(long)]
        category: String,
        /// Name to record instead of the local file name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// Continue an upload that was already initialized
        #[arg(long, value_parser = parse_file_key)]
        resume: Option<FileKey>,
    },
    /// Remove stale uploads
    Sweep {
        /// Keep sweeping on the configured interval until interrupted
        #[arg(long, default_value_t = false)]
        daemon: bool,
    },
    /// Check the metadata store, cache and storage roots
    Health,
}

fn parse_file_key(s: &str) -> Result<FileKey, String> {
    FileKey::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    parcel_engine::metrics::register_metrics();

    let engine = UploadEngine::from_config(&config)
        .await
        .context("failed to initialize upload engine")?;
    let actor = cli.actor.actor();

    run(cli.command, &engine, &config, &actor).await?;

    if cli.print_metrics {
        let text = parcel_engine::metrics::gather_text().context("failed to render metrics")?;
        eprint!("{text}");
    }
    Ok(())
}

/// Load configuration from an optional TOML file overlaid with `PARCEL_`
/// environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("PARCEL_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn run(
    command: Commands,
    engine: &UploadEngine,
    config: &AppConfig,
    actor: &Actor,
) -> Result<()> {
    match command {
        Commands::Init {
            file_name,
            category,
            total_size,
            chunk_size,
            chunk_count,
            content_hash,
            origin_ip,
        } => {
            let chunk_count = match chunk_count {
                Some(count) => count,
                None => derived_chunk_count(total_size, chunk_size)?,
            };
            let outcome = engine
                .initialize(
                    InitRequest {
                        file_name,
                        category,
                        chunk_count,
                        chunk_size,
                        total_size,
                        content_hash,
                        origin_ip,
                    },
                    actor,
                )
                .await?;
            print_json(&outcome)
        }
        Commands::PutChunk {
            file_key,
            index,
            path,
        } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let accepted = engine
                .accept_chunk(&file_key, index, Bytes::from(data), actor)
                .await?;
            print_json(&accepted)
        }
        Commands::Exists { file_key, index } => {
            let exists = engine.chunk_exists(&file_key, index).await?;
            print_json(&serde_json::json!({ "exists": exists }))
        }
        Commands::Missing { file_key } => {
            let missing = engine.missing_chunks(&file_key).await?;
            print_json(&serde_json::json!({ "missing": missing }))
        }
        Commands::Merge { file_key } => {
            let merged = engine.merge(&file_key, actor).await?;
            print_json(&merged)
        }
        Commands::Delete { file_key } => {
            engine.delete(&file_key, actor).await?;
            print_json(&serde_json::json!({ "deleted": file_key }))
        }
        Commands::Show { file_key } => {
            let record = engine.get_record(&file_key).await?;
            if !actor.can_access(&record.owner_id) {
                return Err(UploadError::PermissionDenied(file_key).into());
            }
            print_json(&record)
        }
        Commands::List { all, limit } => {
            if all && actor.role != Role::Admin {
                bail!("--all requires --admin");
            }
            let owner = if all { None } else { Some(actor.id.as_str()) };
            let records: Vec<UploadRecord> = engine.list_records(owner, limit).await?;
            print_json(&records)
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            print_json(&serde_json::json!({
                "uploading": stats.uploading,
                "completed": stats.completed,
                "completed_bytes": stats.completed_bytes,
            }))
        }
        Commands::Upload {
            path,
            category,
            name,
            chunk_size,
            resume,
        } => {
            let outcome = upload_file(engine, actor, &path, category, name, chunk_size, resume)
                .await?;
            print_json(&outcome)
        }
        Commands::Sweep { daemon } => {
            let sweeper = engine.sweeper(config.sweeper.clone());
            if !daemon {
                let stats = sweeper.run_once().await?;
                return print_json(&stats);
            }
            if !config.sweeper.enabled {
                bail!("sweeper is disabled in configuration (sweeper.enabled = false)");
            }

            let cancel = CancellationToken::new();
            let handle = Arc::new(sweeper).spawn(cancel.clone());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
            handle.await.context("sweeper task panicked")?;
            Ok(())
        }
        Commands::Health => {
            engine.health_check().await?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
    }
}

fn derived_chunk_count(total_size: u64, chunk_size: u64) -> Result<u32> {
    let count = UploadRecord::implied_chunk_count(total_size, chunk_size);
    u32::try_from(count).with_context(|| format!("chunk count {count} out of range"))
}

#[derive(Debug, Serialize)]
struct UploadSummary {
    file_key: FileKey,
    deduplicated: bool,
    chunks_sent: u32,
    chunks_skipped: u32,
    final_path: String,
    final_size: u64,
    content_hash: String,
}

/// Run the whole protocol for a local file: initialize (or resume), send the
/// chunks the engine does not have yet, then merge.
async fn upload_file(
    engine: &UploadEngine,
    actor: &Actor,
    path: &Path,
    category: String,
    name: Option<String>,
    chunk_size: u64,
    resume: Option<FileKey>,
) -> Result<UploadSummary> {
    let total_size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let chunk_count = derived_chunk_count(total_size, chunk_size)?;

    let file_key = match resume {
        Some(file_key) => file_key,
        None => {
            let file_name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("path has no file name")?,
            };
            let content_hash = hash_file(path).await?;
            let outcome = engine
                .initialize(
                    InitRequest {
                        file_name,
                        category,
                        chunk_count,
                        chunk_size,
                        total_size,
                        content_hash: Some(content_hash.to_hex()),
                        origin_ip: None,
                    },
                    actor,
                )
                .await?;

            if outcome.deduplicated {
                let record = engine.get_record(&outcome.file_key).await?;
                return Ok(UploadSummary {
                    file_key: outcome.file_key,
                    deduplicated: true,
                    chunks_sent: 0,
                    chunks_skipped: chunk_count,
                    final_path: record.final_path.unwrap_or_default(),
                    final_size: record.final_size.unwrap_or_default(),
                    content_hash: content_hash.to_hex(),
                });
            }
            outcome.file_key
        }
    };

    let missing = engine.missing_chunks(&file_key).await?;
    let skipped = chunk_count.saturating_sub(missing.len() as u32);
    let parallelism = engine.config().max_concurrent_chunk_writes.max(1) as usize;

    let mut sends = futures::stream::iter(missing.iter().copied())
        .map(|index| send_chunk(engine, actor, path, &file_key, index, chunk_size, total_size))
        .buffer_unordered(parallelism);
    let mut sent = 0u32;
    while let Some(result) = sends.next().await {
        result?;
        sent += 1;
    }
    drop(sends);

    tracing::info!(file_key = %file_key, sent, skipped, "All chunks sent, merging");
    let merged = engine.merge(&file_key, actor).await?;

    Ok(UploadSummary {
        file_key,
        deduplicated: false,
        chunks_sent: sent,
        chunks_skipped: skipped,
        final_path: merged.final_path,
        final_size: merged.final_size,
        content_hash: merged.content_hash,
    })
}

async fn send_chunk(
    engine: &UploadEngine,
    actor: &Actor,
    path: &Path,
    file_key: &FileKey,
    index: u32,
    chunk_size: u64,
    total_size: u64,
) -> Result<()> {
    let offset = u64::from(index) * chunk_size;
    let len = chunk_size.min(total_size.saturating_sub(offset));
    let mut buf = vec![0u8; len as usize];
    {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf)
            .await
            .with_context(|| format!("failed to read chunk {index}"))?;
    }
    let data = Bytes::from(buf);

    let mut attempt = 1;
    loop {
        match engine
            .accept_chunk(file_key, index, data.clone(), actor)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < CHUNK_ATTEMPTS => {
                tracing::debug!(chunk_index = index, attempt, error = %e, "Retrying chunk");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("failed to send chunk {index}")));
            }
        }
    }
}

async fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = ContentHash::hasher();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_upload_command() {
        let cli = Cli::try_parse_from([
            "parcel",
            "--actor",
            "alice",
            "upload",
            "./report.pdf",
            "--category",
            "文档",
            "--chunk-size",
            "1024",
        ])
        .unwrap();
        assert_eq!(cli.actor.id, "alice");
        assert!(!cli.actor.admin);
        match cli.command {
            Commands::Upload {
                chunk_size,
                category,
                resume,
                ..
            } => {
                assert_eq!(chunk_size, 1024);
                assert_eq!(category, "文档");
                assert!(resume.is_none());
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_rejects_malformed_file_key() {
        assert!(Cli::try_parse_from(["parcel", "merge", "not-a-key"]).is_err());
    }

    #[test]
    fn test_derived_chunk_count() {
        assert_eq!(derived_chunk_count(2_621_440, 1_048_576).unwrap(), 3);
        assert_eq!(derived_chunk_count(0, 1024).unwrap(), 1);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcel.toml");
        std::fs::write(
            &path,
            r#"
[engine]
max_concurrent_chunk_writes = 8

[storage]
temp_root = "/srv/parcel/chunks"
final_root = "/srv/parcel/files"

[sweeper]
stale_after_secs = 3600
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.engine.max_concurrent_chunk_writes, 8);
        assert_eq!(config.sweeper.stale_after_secs, 3600);
        assert_eq!(config.storage.final_root, PathBuf::from("/srv/parcel/files"));
        // Unset fields keep their defaults.
        assert_eq!(config.engine.slot_ttl_secs, 60);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcel.toml");
        std::fs::write(&path, "[sweeper]\ninterval_secs = 0\n").unwrap();
        assert!(load_config(path.to_str().unwrap()).is_err());
    }
}
