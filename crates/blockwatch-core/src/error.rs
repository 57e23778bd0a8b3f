//! Error types for blockwatch-core

use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for blockwatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Delivery transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Supervisor lifecycle errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

impl Error {
    /// Remediation guidance for this error.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Config(err) => err.remediation(),
            Self::Transport(err) => err.remediation(),
            Self::Supervisor(err) => err.remediation(),
        }
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Fall back to WatchdogConfig::default()."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .alternative("Unknown keys are ignored; check value types."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("blocked_threshold_ms must exceed the derived poll interval.")
            }
        }
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport is closed")]
    Closed,

    #[error("envelope rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io(_) | Self::Closed => {
                Remediation::new("The delivery sink is unavailable; diagnostics were dropped.")
                    .alternative("Point the transport at a writable destination.")
            }
            Self::Serialize(_) => Remediation::new("Event serialization failed."),
            Self::Rejected(reason) => Remediation::new(format!(
                "The transport refused the envelope: {reason}"
            )),
        }
    }
}

/// Errors starting the supervisor's isolated thread
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn supervisor thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("failed to build supervisor runtime: {0}")]
    RuntimeBuild(std::io::Error),
}

impl SupervisorError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ThreadSpawn(_) => {
                Remediation::new("The process could not allocate a thread for the supervisor.")
                    .alternative("Check thread limits (ulimit -u) and available memory.")
            }
            Self::RuntimeBuild(_) => {
                Remediation::new("The supervisor's runtime could not be created.")
                    .alternative("Check file descriptor limits (ulimit -n).")
            }
        }
    }
}
