//! Command implementations for the searchsync admin tool.
//!
//! Handles:
//! - config: print the effective layered settings
//! - timestamp: read and edit the persisted sync timestamps
//! - next-window: compute the next trigger from the persisted timestamp

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use searchsync_scheduler::{StorageTimestampStore, StreamConfig, StreamTrigger, TimestampStore};
use searchsync_storage::Storage;
use searchsync_types::Settings;

use crate::cli::TimestampCommands;

/// Load configuration and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(db_path) = db_path_override {
        settings.db_path = db_path.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Render settings as TOML.
pub fn render_config(settings: &Settings) -> Result<String> {
    toml::to_string_pretty(settings).context("Failed to render settings")
}

/// Open the RocksDB store at the configured path, creating parent directories.
pub fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    info!("Opening storage at {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Storage::open(&db_path).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

/// Run a timestamp subcommand and return the lines to print.
pub fn handle_timestamp(storage: &Storage, command: TimestampCommands) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match command {
        TimestampCommands::Get { sync_type } => {
            match storage.get_sync_timestamp(&sync_type)? {
                Some(record) => lines.push(format!(
                    "{sync_type}: {} (updated {})",
                    record.timestamp.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                )),
                None => lines.push(format!("{sync_type}: not set")),
            }
            if let Some(run) = storage.get_run_record(&sync_type)? {
                let outcome = if run.success { "success" } else { "failure" };
                let mut line = format!(
                    "last run: {outcome} for [{}, {}) finished {}",
                    run.window_start.to_rfc3339(),
                    run.window_end.to_rfc3339(),
                    run.finished_at.to_rfc3339()
                );
                if let Some(message) = run.message {
                    line.push_str(&format!(" ({message})"));
                }
                lines.push(line);
            }
        }
        TimestampCommands::Set {
            sync_type,
            timestamp,
        } => {
            let timestamp = parse_timestamp(&timestamp)?;
            storage.put_sync_timestamp(&sync_type, timestamp)?;
            storage.flush()?;
            info!(sync_type = %sync_type, timestamp = %timestamp.to_rfc3339(), "Sync timestamp set");
            lines.push(format!("{sync_type}: {}", timestamp.to_rfc3339()));
        }
        TimestampCommands::Reset { sync_type } => {
            if storage.delete_sync_timestamp(&sync_type)? {
                storage.flush()?;
                lines.push(format!("{sync_type}: reset"));
            } else {
                lines.push(format!("{sync_type}: not set"));
            }
        }
        TimestampCommands::List => {
            let all = storage.list_sync_timestamps()?;
            if all.is_empty() {
                lines.push("no sync timestamps".to_string());
            }
            for (sync_type, record) in all {
                lines.push(format!("{sync_type}: {}", record.timestamp.to_rfc3339()));
            }
        }
    }
    Ok(lines)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Trigger a freshly started supervisor would compute for `sync_type`.
pub async fn next_window(
    storage: Arc<Storage>,
    settings: &Settings,
    sync_type: &str,
    now: DateTime<Utc>,
) -> Result<StreamTrigger> {
    let store = StorageTimestampStore::new(storage);
    let persisted = store
        .get(sync_type)
        .await
        .context("Failed to read sync timestamp")?;
    let config = StreamConfig::from_settings(&settings.stream);
    Ok(StreamTrigger::initial(persisted, &config, now))
}
