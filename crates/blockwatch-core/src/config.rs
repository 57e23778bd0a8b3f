//! Configuration management for blockwatch
//!
//! Handles loading and validation of `blockwatch.toml` files:
//!
//! ```toml
//! [watchdog]
//! blocked_threshold_ms = 2000
//! poll_ratio = 5
//! max_blocked_events = 1
//! app_root = "/srv/app"
//!
//! [watchdog.static_tags]
//! service = "ingest"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Detection and emission settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LogConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.watchdog.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml_str(&source)
    }
}

/// Watchdog configuration, immutable once a supervisor starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// A unit is blocked once its heartbeat is older than this (ms).
    pub blocked_threshold_ms: u64,
    /// Heartbeats (and supervisor ticks) per threshold window.
    pub poll_ratio: u32,
    /// Events emitted before the process is scheduled to exit.
    pub max_blocked_events: u32,
    /// Tags attached to every diagnostic event.
    pub static_tags: BTreeMap<String, String>,
    /// Frame paths under this root are reported as `app:///<relative>`.
    pub app_root: Option<PathBuf>,
    pub environment: Option<String>,
    pub release: Option<String>,
    pub dist: Option<String>,
    /// Upper bound on waiting for the transport to drain after a send (ms).
    pub flush_timeout_ms: u64,
    /// Upper bound on delivering the abnormal session update (ms).
    pub session_send_timeout_ms: u64,
    /// Delay between exhausting the event budget and process exit (ms).
    pub exit_grace_ms: u64,
    /// Exit status used when the budget is exhausted.
    pub exit_code: i32,
    /// Verbose per-tick logging.
    pub debug: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            blocked_threshold_ms: 1_000,
            poll_ratio: 5,
            max_blocked_events: 1,
            static_tags: BTreeMap::new(),
            app_root: None,
            environment: None,
            release: None,
            dist: None,
            flush_timeout_ms: 2_000,
            session_send_timeout_ms: 1_000,
            exit_grace_ms: 5_000,
            exit_code: 1,
            debug: false,
        }
    }
}

impl WatchdogConfig {
    /// Config with the given threshold and defaults elsewhere.
    #[must_use]
    pub fn with_threshold(blocked_threshold: Duration) -> Self {
        Self {
            blocked_threshold_ms: duration_ms(blocked_threshold),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn blocked_threshold(&self) -> Duration {
        Duration::from_millis(self.blocked_threshold_ms)
    }

    /// Heartbeat and tick period: `blocked_threshold / poll_ratio`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_threshold_ms / u64::from(self.poll_ratio.max(1)))
    }

    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    #[must_use]
    pub fn session_send_timeout(&self) -> Duration {
        Duration::from_millis(self.session_send_timeout_ms)
    }

    #[must_use]
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocked_threshold_ms == 0 {
            return Err(ConfigError::ValidationError(
                "blocked_threshold_ms must be greater than zero".to_string(),
            ));
        }
        if self.poll_ratio < 2 {
            return Err(ConfigError::ValidationError(format!(
                "poll_ratio must be at least 2 (got {})",
                self.poll_ratio
            )));
        }
        if self.poll_interval().is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "blocked_threshold_ms {} is too small for poll_ratio {}",
                self.blocked_threshold_ms, self.poll_ratio
            )));
        }
        if self.poll_interval() >= self.blocked_threshold() {
            return Err(ConfigError::ValidationError(
                "poll interval must be shorter than the blocked threshold".to_string(),
            ));
        }
        if self.max_blocked_events == 0 {
            return Err(ConfigError::ValidationError(
                "max_blocked_events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = WatchdogConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.max_blocked_events, 1);
    }

    #[test]
    fn poll_interval_is_threshold_over_ratio() {
        let config = WatchdogConfig {
            blocked_threshold_ms: 100,
            poll_ratio: 5,
            ..WatchdogConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert!(config.poll_interval() < config.blocked_threshold());
    }

    #[test]
    fn rejects_zero_threshold() {
        let config = WatchdogConfig {
            blocked_threshold_ms: 0,
            ..WatchdogConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_ratio_below_two() {
        let config = WatchdogConfig {
            poll_ratio: 1,
            ..WatchdogConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sub_millisecond_poll_interval() {
        let config = WatchdogConfig {
            blocked_threshold_ms: 3,
            poll_ratio: 5,
            ..WatchdogConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_event_budget() {
        let config = WatchdogConfig {
            max_blocked_events: 0,
            ..WatchdogConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_sections() {
        let config = Config::from_toml_str(
            r#"
            [watchdog]
            blocked_threshold_ms = 2500
            max_blocked_events = 3
            app_root = "/srv/app"
            release = "ingest@1.2.3"

            [watchdog.static_tags]
            service = "ingest"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.watchdog.blocked_threshold_ms, 2500);
        assert_eq!(config.watchdog.poll_ratio, 5);
        assert_eq!(config.watchdog.max_blocked_events, 3);
        assert_eq!(config.watchdog.app_root, Some(PathBuf::from("/srv/app")));
        assert_eq!(
            config.watchdog.static_tags.get("service").map(String::as_str),
            Some("ingest")
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.watchdog, WatchdogConfig::default());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let err = Config::from_toml_str("[watchdog]\npoll_ratio = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn malformed_toml_fails_parse() {
        let err = Config::from_toml_str("[watchdog\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[watchdog]\nblocked_threshold_ms = 750").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.watchdog.blocked_threshold_ms, 750);
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn log_format_roundtrip() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
