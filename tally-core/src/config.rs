//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tally/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tally/` (~/.config/tally/)
//! - Data: `$XDG_DATA_HOME/tally/` (~/.local/share/tally/)
//! - State/Logs: `$XDG_STATE_HOME/tally/` (~/.local/state/tally/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Producing application identity and SDK key
    #[serde(default)]
    pub app: AppConfig,

    /// Collector endpoint and delivery tuning
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the application producing events
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// SDK key: the first four characters are the public key, the rest the secret
    pub sdk_key: Option<String>,

    /// Bundle identifier reported as `bu`
    #[serde(default = "default_bundle_id")]
    pub bundle_id: String,

    /// Application version reported as `av`
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Stable device identifier used to derive the hardware id.
    /// When absent a random id is generated once and persisted.
    pub hardware_seed: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sdk_key: None,
            bundle_id: default_bundle_id(),
            app_version: default_app_version(),
            hardware_seed: None,
        }
    }
}

fn default_bundle_id() -> String {
    "unknown".to_string()
}

fn default_app_version() -> String {
    "0".to_string()
}

impl AppConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        match &self.sdk_key {
            None => Err(Error::Config("app.sdk_key is required".to_string())),
            Some(key) if key.chars().count() <= 4 => Err(Error::Config(
                "app.sdk_key must be longer than 4 characters".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Collector URL events are delivered to
    #[serde(default = "default_collector_endpoint")]
    pub endpoint: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,

    /// Upper bound on a single delivery attempt, in seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Backoff delay after the first failure is twice this value
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap on the backoff delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_collector_endpoint(),
            timeout_secs: default_collector_timeout(),
            attempt_timeout_secs: default_attempt_timeout(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl CollectorConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config(
                "collector.endpoint must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 || self.attempt_timeout_secs == 0 {
            return Err(Error::Config(
                "collector timeouts must be greater than zero".to_string(),
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(Error::Config(
                "collector.initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::Config(
                "collector.max_delay_ms must be >= collector.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Upper bound on one delivery attempt
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Initial backoff delay
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum backoff delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_collector_endpoint() -> String {
    "https://a.distimo.mobi/e/".to_string()
}

fn default_collector_timeout() -> u64 {
    30
}

fn default_attempt_timeout() -> u64 {
    60
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    32000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tally/config.toml` (~/.config/tally/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tally").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/tally/` (~/.local/share/tally/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tally")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tally/` (~/.local/state/tally/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tally")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/tally/events.db` (~/.local/share/tally/events.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("events.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/tally/tally.log` (~/.local/state/tally/tally.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("tally.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
