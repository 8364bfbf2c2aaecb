//! Searchsync admin tool
//!
//! # Usage
//!
//! ```bash
//! searchsync config
//! searchsync timestamp get|set|reset|list
//! searchsync next-window [SYNC_TYPE]
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/searchsync/config.toml)
//! 3. Environment variables (SEARCHSYNC_*)
//! 4. CLI flags

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

use searchsync_daemon::{
    handle_timestamp, init_logging, load_settings, next_window, open_storage, render_config, Cli,
    Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(
        cli.config.as_deref(),
        cli.db_path.as_deref(),
        cli.log_level.as_deref(),
    )?;
    init_logging(&settings.log_level)?;

    match cli.command {
        Commands::Config => {
            print!("{}", render_config(&settings)?);
        }
        Commands::Timestamp { command } => {
            let storage = open_storage(&settings)?;
            for line in handle_timestamp(&storage, command)? {
                println!("{line}");
            }
        }
        Commands::NextWindow { sync_type } => {
            let storage = open_storage(&settings)?;
            let trigger = next_window(storage, &settings, &sync_type, Utc::now()).await?;
            println!("sync type:     {sync_type}");
            println!("query start:   {}", trigger.query_start.to_rfc3339());
            println!("query end:     {}", trigger.query_end.to_rfc3339());
            println!("planned start: {}", trigger.planned_stream_start.to_rfc3339());
        }
    }

    Ok(())
}
