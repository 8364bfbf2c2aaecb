//! Configuration loading for searchsync.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/searchsync/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SearchSyncError;

/// Change queue, enforcement and bulk write settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterSettings {
    /// Maximum number of write models in one bulk write
    #[serde(default = "default_max_bulk_size")]
    pub max_bulk_size: usize,

    /// Concurrent entity retrievals in the enforcement stage
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Concurrent bulk writes
    #[serde(default = "default_write_parallelism")]
    pub write_parallelism: usize,

    /// Interval between lane drains; 0 drains as fast as downstream demands
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Merges processed before pending drain requests are served
    #[serde(default = "default_max_merge_burst")]
    pub max_merge_burst: usize,

    /// Optional field selector passed to partial retrieval
    #[serde(default)]
    pub field_selector: Option<String>,

    /// Name of the search update mapper
    #[serde(default = "default_mapper")]
    pub mapper: String,
}

fn default_max_bulk_size() -> usize {
    250
}

fn default_parallelism() -> usize {
    16
}

fn default_write_parallelism() -> usize {
    1
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_max_merge_burst() -> usize {
    256
}

fn default_mapper() -> String {
    "default".to_string()
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            max_bulk_size: default_max_bulk_size(),
            parallelism: default_parallelism(),
            write_parallelism: default_write_parallelism(),
            drain_interval_ms: default_drain_interval_ms(),
            max_merge_burst: default_max_merge_burst(),
            field_selector: None,
            mapper: default_mapper(),
        }
    }
}

impl UpdaterSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Policy enforcer cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Entries older than this are reloaded on access
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum cached enforcers
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Delay before the single retry on a stale or missing enforcer
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Background consistency sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSyncSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mismatches younger than this are presumed in flight
    #[serde(default = "default_tolerance_window_secs")]
    pub tolerance_window_secs: u64,

    /// Repair signals emitted per throttle period
    #[serde(default = "default_throttle_elements")]
    pub throttle_elements: usize,

    #[serde(default = "default_throttle_period_ms")]
    pub throttle_period_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_tolerance_window_secs() -> u64 {
    300
}

fn default_throttle_elements() -> usize {
    100
}

fn default_throttle_period_ms() -> u64 {
    1000
}

impl Default for BackgroundSyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance_window_secs: default_tolerance_window_secs(),
            throttle_elements: default_throttle_elements(),
            throttle_period_ms: default_throttle_period_ms(),
        }
    }
}

impl BackgroundSyncSettings {
    pub fn tolerance_window(&self) -> Duration {
        Duration::from_secs(self.tolerance_window_secs)
    }

    pub fn throttle_period(&self) -> Duration {
        Duration::from_millis(self.throttle_period_ms)
    }
}

/// Periodic stream supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Width of one query window
    #[serde(default = "default_stream_interval_secs")]
    pub interval_secs: u64,

    /// Delay after a window closes before it is streamed
    #[serde(default = "default_start_offset_secs")]
    pub start_offset_secs: u64,

    /// How far back the first window starts when nothing was persisted
    #[serde(default = "default_initial_start_offset_secs")]
    pub initial_start_offset_secs: u64,

    /// Staleness of the last sync point that reports a warning
    #[serde(default = "default_warn_offset_secs")]
    pub warn_offset_secs: u64,

    /// Staleness of the last sync point that reports an error
    #[serde(default = "default_error_offset_secs")]
    pub error_offset_secs: u64,

    /// Forwarder gives up after this long without activity
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Minimal delay between two streams
    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: u64,

    #[serde(default = "default_self_check_interval_secs")]
    pub self_check_interval_secs: u64,

    /// Supervisor counts as stuck if no forwarder started or stopped for this long
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,

    /// Back-off before a stuck supervisor is restarted
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,
}

fn default_stream_interval_secs() -> u64 {
    300
}

fn default_start_offset_secs() -> u64 {
    60
}

fn default_initial_start_offset_secs() -> u64 {
    86_400
}

fn default_warn_offset_secs() -> u64 {
    1800
}

fn default_error_offset_secs() -> u64 {
    3600
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_min_delay_secs() -> u64 {
    1
}

fn default_self_check_interval_secs() -> u64 {
    60
}

fn default_stuck_after_secs() -> u64 {
    3600
}

fn default_restart_backoff_secs() -> u64 {
    10
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_stream_interval_secs(),
            start_offset_secs: default_start_offset_secs(),
            initial_start_offset_secs: default_initial_start_offset_secs(),
            warn_offset_secs: default_warn_offset_secs(),
            error_offset_secs: default_error_offset_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            min_delay_secs: default_min_delay_secs(),
            self_check_interval_secs: default_self_check_interval_secs(),
            stuck_after_secs: default_stuck_after_secs(),
            restart_backoff_secs: default_restart_backoff_secs(),
        }
    }
}

impl StreamSettings {
    /// Validate trigger invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("interval_secs must be > 0".to_string());
        }
        if self.idle_timeout_secs == 0 {
            return Err("idle_timeout_secs must be > 0".to_string());
        }
        if self.error_offset_secs < self.warn_offset_secs {
            return Err(format!(
                "error_offset_secs ({}) must be >= warn_offset_secs ({})",
                self.error_offset_secs, self.warn_offset_secs
            ));
        }
        let longest_cycle = self.interval_secs + self.start_offset_secs + self.idle_timeout_secs;
        if self.stuck_after_secs <= longest_cycle {
            return Err(format!(
                "stuck_after_secs ({}) must exceed interval + start offset + idle timeout ({})",
                self.stuck_after_secs, longest_cycle
            ));
        }
        Ok(())
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory (sync timestamps)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub updater: UpdaterSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub background_sync: BackgroundSyncSettings,

    #[serde(default)]
    pub stream: StreamSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "searchsync")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            updater: UpdaterSettings::default(),
            cache: CacheSettings::default(),
            background_sync: BackgroundSyncSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/searchsync/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (SEARCHSYNC_*, nested keys separated by `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, SearchSyncError> {
        let config_dir = ProjectDirs::from("", "", "searchsync")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| SearchSyncError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| SearchSyncError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: SEARCHSYNC_DB_PATH, SEARCHSYNC_UPDATER__MAX_BULK_SIZE, etc.
        builder = builder.add_source(
            Environment::with_prefix("SEARCHSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| SearchSyncError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| SearchSyncError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SearchSyncError> {
        if self.updater.max_bulk_size == 0 {
            return Err(SearchSyncError::Config(
                "updater.max_bulk_size must be > 0".to_string(),
            ));
        }
        if self.updater.parallelism == 0 || self.updater.write_parallelism == 0 {
            return Err(SearchSyncError::Config(
                "updater parallelism must be > 0".to_string(),
            ));
        }
        if self.updater.max_merge_burst == 0 {
            return Err(SearchSyncError::Config(
                "updater.max_merge_burst must be > 0".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(SearchSyncError::Config(
                "cache.capacity must be > 0".to_string(),
            ));
        }
        if self.background_sync.throttle_elements == 0 {
            return Err(SearchSyncError::Config(
                "background_sync.throttle_elements must be > 0".to_string(),
            ));
        }
        self.stream
            .validate()
            .map_err(|e| SearchSyncError::Config(format!("stream: {e}")))
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}
