//! CLI argument parsing for the searchsync admin tool.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

/// Searchsync admin tool
///
/// Inspects the configuration and the persisted sync timestamps of the
/// search index updater.
#[derive(Parser, Debug)]
#[command(name = "searchsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/searchsync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective settings as TOML
    Config,

    /// Inspect or change persisted sync timestamps
    Timestamp {
        #[command(subcommand)]
        command: TimestampCommands,
    },

    /// Print the window the supervisor would stream next
    NextWindow {
        /// Sync type of the stream
        #[arg(default_value = "background-sync")]
        sync_type: String,
    },
}

/// Timestamp subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum TimestampCommands {
    /// Show the sync timestamp and last run of a stream
    Get {
        sync_type: String,
    },

    /// Set the sync timestamp of a stream
    Set {
        sync_type: String,

        /// RFC 3339 timestamp, e.g. 2025-01-31T12:00:00Z
        timestamp: String,
    },

    /// Remove the sync timestamp so the next start uses the initial offset
    Reset {
        sync_type: String,
    },

    /// List all sync timestamps
    List,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config() {
        let cli = Cli::parse_from(["searchsync", "config"]);
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_cli_with_config_file() {
        let cli = Cli::parse_from(["searchsync", "--config", "/path/to/config.toml", "config"]);
        assert_eq!(cli.config, Some("/path/to/config.toml".to_string()));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "searchsync",
            "timestamp",
            "list",
            "--db-path",
            "/custom/db",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.db_path, Some("/custom/db".to_string()));
        assert_eq!(cli.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_cli_timestamp_set() {
        let cli = Cli::parse_from([
            "searchsync",
            "timestamp",
            "set",
            "catch-up",
            "2025-01-31T12:00:00Z",
        ]);
        match cli.command {
            Commands::Timestamp {
                command: TimestampCommands::Set { sync_type, timestamp },
            } => {
                assert_eq!(sync_type, "catch-up");
                assert_eq!(timestamp, "2025-01-31T12:00:00Z");
            }
            _ => panic!("Expected Timestamp Set command"),
        }
    }

    #[test]
    fn test_cli_timestamp_reset() {
        let cli = Cli::parse_from(["searchsync", "timestamp", "reset", "background-sync"]);
        match cli.command {
            Commands::Timestamp {
                command: TimestampCommands::Reset { sync_type },
            } => assert_eq!(sync_type, "background-sync"),
            _ => panic!("Expected Timestamp Reset command"),
        }
    }

    #[test]
    fn test_cli_next_window_default_sync_type() {
        let cli = Cli::parse_from(["searchsync", "next-window"]);
        match cli.command {
            Commands::NextWindow { sync_type } => assert_eq!(sync_type, "background-sync"),
            _ => panic!("Expected NextWindow command"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["searchsync"]).is_err());
    }
}
