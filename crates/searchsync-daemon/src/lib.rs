//! Searchsync admin tool library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (config, timestamp, next-window)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, TimestampCommands};
pub use commands::{
    handle_timestamp, init_logging, load_settings, next_window, open_storage, render_config,
};
