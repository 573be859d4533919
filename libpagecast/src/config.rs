//! Configuration management for Pagecast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::{DEFAULT_MAX_ATTEMPTS, MAX_BATCH_SIZE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/pagecast/queue.db".to_string()
}

/// Queue processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Items claimed per cycle (clamped to 1..=20)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts allowed per queue item before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Items of one batch processed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,

    /// Age after which a `processing` item is considered abandoned
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,

    /// Interval between cycles when running as a daemon
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl QueueConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }
}

fn default_batch_size() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_concurrency() -> usize {
    4
}

fn default_cycle_timeout_secs() -> u64 {
    300
}

fn default_stuck_timeout_secs() -> u64 {
    15 * 60
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// Backoff between attempts of one queue item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_base_delay_secs() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    15 * 60
}

/// Meta Graph API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Status polls for an Instagram video container before giving up for this attempt
    #[serde(default = "default_media_status_checks")]
    pub media_status_checks: u32,
    #[serde(default = "default_media_status_interval_ms")]
    pub media_status_interval_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_graph_base_url(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout_secs(),
            media_status_checks: default_media_status_checks(),
            media_status_interval_ms: default_media_status_interval_ms(),
        }
    }
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v18.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_media_status_checks() -> u32 {
    10
}

fn default_media_status_interval_ms() -> u64 {
    3000
}

impl Config {
    /// Load configuration from the default location
    ///
    /// An explicitly named file (`PAGECAST_CONFIG`) must exist. When the
    /// default location holds no file, built-in defaults are used.
    /// `PAGECAST_DB_PATH` overrides `database.path` in either case.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("PAGECAST_CONFIG").is_ok();
        let config_path = resolve_config_path()?;

        let mut config = if !explicit && !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file found, using defaults");
            Self::default()
        } else {
            Self::load_from_path(&config_path)?
        };

        if let Ok(db_path) = std::env::var("PAGECAST_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        let q = &self.queue;
        if q.batch_size == 0 || q.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                "queue.batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }
        if q.max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }
        if q.concurrency == 0 {
            return Err(invalid("queue.concurrency", "must be at least 1"));
        }
        if q.cycle_timeout_secs == 0 {
            return Err(invalid("queue.cycle_timeout_secs", "must be positive"));
        }
        if q.stuck_timeout_secs == 0 {
            return Err(invalid("queue.stuck_timeout_secs", "must be positive"));
        }
        // A cycle still running when the sweep fires would publish alongside the next claim
        if q.cycle_timeout_secs >= q.stuck_timeout_secs {
            return Err(invalid(
                "queue.cycle_timeout_secs",
                "must be smaller than queue.stuck_timeout_secs",
            ));
        }
        if q.poll_interval_secs == 0 {
            return Err(invalid("queue.poll_interval_secs", "must be positive"));
        }

        let r = &self.retry;
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier", "must be a finite number >= 1.0"));
        }
        if r.max_delay_secs < r.base_delay_secs {
            return Err(invalid(
                "retry.max_delay_secs",
                "must not be smaller than retry.base_delay_secs",
            ));
        }

        let g = &self.graph;
        if !(g.base_url.starts_with("http://") || g.base_url.starts_with("https://")) {
            return Err(invalid("graph.base_url", "must be an http(s) URL"));
        }
        if g.request_timeout_secs == 0 {
            return Err(invalid("graph.request_timeout_secs", "must be positive"));
        }
        if g.media_status_checks == 0 {
            return Err(invalid("graph.media_status_checks", "must be at least 1"));
        }

        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> crate::error::PagecastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("PAGECAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("pagecast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue.batch_size, 5);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.stuck_timeout_secs, 900);
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.retry.max_delay_secs, 900);
        assert_eq!(config.graph.base_url, "https://graph.facebook.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/pagecast-test.db"

[queue]
batch_size = 10
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.database.path, "/tmp/pagecast-test.db");
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.concurrency, 4);
        assert_eq!(config.retry.multiplier, 2.0);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue\nbatch_size = ").unwrap();

        let err = Config::load_from_path(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_validate_rejects_oversized_batch() {
        let mut config = Config::default();
        config.queue.batch_size = 21;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue.batch_size"));

        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_retry_settings() {
        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_delay_secs = 10;
        config.retry.base_delay_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cycle_timeout_not_below_stuck_timeout() {
        let mut config = Config::default();
        config.queue.cycle_timeout_secs = 1800;
        config.queue.stuck_timeout_secs = 900;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue.cycle_timeout_secs"));

        config.queue.cycle_timeout_secs = 900;
        assert!(config.validate().is_err());

        config.queue.cycle_timeout_secs = 899;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_media_status_checks() {
        let mut config = Config::default();
        config.graph.media_status_checks = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("graph.media_status_checks"));
    }

    #[test]
    fn test_validate_rejects_non_http_base_url() {
        let mut config = Config::default();
        config.graph.base_url = "graph.facebook.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_honours_env_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nmax_attempts = 5").unwrap();

        std::env::set_var("PAGECAST_CONFIG", file.path());
        std::env::set_var("PAGECAST_DB_PATH", "/tmp/override.db");
        let config = Config::load();
        std::env::remove_var("PAGECAST_CONFIG");
        std::env::remove_var("PAGECAST_DB_PATH");

        let config = config.unwrap();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.database.path, "/tmp/override.db");
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        std::env::set_var("PAGECAST_CONFIG", "/nonexistent/pagecast/config.toml");
        let result = Config::load();
        std::env::remove_var("PAGECAST_CONFIG");

        assert!(result.is_err());
    }

    #[test]
    fn test_database_path_expands_tilde() {
        let config = Config::default();
        let path = config.database_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("pagecast/queue.db"));
    }
}
