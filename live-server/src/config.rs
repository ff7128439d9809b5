//! Configuration loading for livedata-server.
//!
//! Configuration is loaded from a TOML file (default: `livedata.toml`).
//! Every section and key is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use live_core::RetryPolicy;

/// Root configuration for livedata-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Liveness configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Client connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Query observer configuration.
    #[serde(default)]
    pub observe: ObserveConfig,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Milliseconds between liveness checks (default: 15000, 0 disables).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Milliseconds to wait for any frame after a ping (default: 15000).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay scale for the exponential part (default: 1000).
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    /// Growth factor per attempt (default: 2.2).
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// Upper bound on any delay (default: 5 minutes).
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Delay for the first `min_count` attempts (default: 10).
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    /// Attempts that use `min_timeout_ms` (default: 2).
    #[serde(default = "default_min_count")]
    pub min_count: u32,
    /// Jitter band width as a fraction (default: 0.5).
    #[serde(default = "default_fuzz")]
    pub fuzz: f64,
}

/// Client connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Address passed to the transport (default: `localhost:3000`).
    #[serde(default = "default_url")]
    pub url: String,
    /// Milliseconds before a connect attempt is abandoned (default: 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Query observer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObserveConfig {
    /// Milliseconds between full re-queries of each observed query, which
    /// pick up writes no notification announced (default: 10000, 0 disables).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_base_timeout_ms() -> u64 {
    1000
}

fn default_exponent() -> f64 {
    2.2
}

fn default_max_timeout_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_min_timeout_ms() -> u64 {
    10
}

fn default_min_count() -> u32 {
    2
}

fn default_fuzz() -> f64 {
    0.5
}

fn default_url() -> String {
    "localhost:3000".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout_ms(),
            exponent: default_exponent(),
            max_timeout_ms: default_max_timeout_ms(),
            min_timeout_ms: default_min_timeout_ms(),
            min_count: default_min_count(),
            fuzz: default_fuzz(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl HeartbeatConfig {
    /// Whether heartbeating is enabled.
    pub fn enabled(&self) -> bool {
        self.interval_ms > 0
    }

    /// Interval between liveness checks.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Time allowed for an answer after a ping.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RetryConfig {
    /// Backoff policy for these settings.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            exponent: self.exponent,
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            min_timeout: Duration::from_millis(self.min_timeout_ms),
            min_count: self.min_count,
            fuzz: self.fuzz,
        }
    }
}

impl ConnectionConfig {
    /// Connect attempt deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ObserveConfig {
    /// Safety re-poll period, `None` when disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that TOML types alone do not enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.enabled() && self.heartbeat.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "heartbeat.timeout_ms must be positive when heartbeats are enabled".into(),
            });
        }
        let retry = &self.retry;
        if !retry.exponent.is_finite() || retry.exponent < 1.0 {
            return Err(ConfigError::Invalid {
                reason: format!("retry.exponent must be at least 1.0, got {}", retry.exponent),
            });
        }
        if !(0.0..=1.0).contains(&retry.fuzz) {
            return Err(ConfigError::Invalid {
                reason: format!("retry.fuzz must be within [0, 1], got {}", retry.fuzz),
            });
        }
        if retry.min_timeout_ms > retry.max_timeout_ms {
            return Err(ConfigError::Invalid {
                reason: "retry.min_timeout_ms exceeds retry.max_timeout_ms".into(),
            });
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "connection.connect_timeout_ms must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(15));
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[heartbeat]
interval_ms = 50
timeout_ms = 75

[retry]
base_timeout_ms = 500
max_timeout_ms = 60000

[connection]
url = "127.0.0.1:4000"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.heartbeat.interval(), Duration::from_millis(50));
        assert_eq!(config.heartbeat.timeout(), Duration::from_millis(75));
        assert_eq!(config.retry.base_timeout_ms, 500);
        assert_eq!(config.retry.exponent, 2.2);
        assert_eq!(config.retry.max_timeout_ms, 60_000);
        assert_eq!(config.connection.url, "127.0.0.1:4000");
        assert_eq!(config.connection.connect_timeout_ms, 10_000);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.heartbeat.interval_ms, 15_000);
        assert_eq!(config.retry.min_count, 2);
    }

    #[test]
    fn observe_poll_interval() {
        let config = Config::default();
        assert_eq!(config.observe.poll_interval(), Some(Duration::from_secs(10)));

        let config: Config = toml::from_str("[observe]\npoll_interval_ms = 250").unwrap();
        assert_eq!(config.observe.poll_interval(), Some(Duration::from_millis(250)));

        let config: Config = toml::from_str("[observe]\npoll_interval_ms = 0").unwrap();
        assert_eq!(config.observe.poll_interval(), None);
    }

    #[test]
    fn zero_interval_disables_heartbeat() {
        let config: Config = toml::from_str("[heartbeat]\ninterval_ms = 0\ntimeout_ms = 0").unwrap();
        assert!(!config.heartbeat.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = Config::default();
        config.retry.fuzz = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = Config::default();
        config.retry.exponent = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = Config::default();
        config.heartbeat.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmin_count = 3").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.retry.min_count, 3);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[retry]\nfuzz = -1.0").unwrap();
        assert!(matches!(
            Config::from_file(bad.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = Config::from_file(Path::new("/nonexistent/livedata.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[heartbeat\ninterval_ms = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
