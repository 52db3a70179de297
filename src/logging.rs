//! Logging setup on `tracing` and `tracing-subscriber`.
//!
//! # Log Levels
//!
//! - `error`: failed generations in a batch
//! - `warn`: fallback text used, refinement kept the baseline, recorded and
//!   computed study days disagree
//! - `info`: one line per generated narrative, batch summaries
//! - `debug`: per-field mapping and template selection
//! - `trace`: each rule that changed the text
//!
//! Field values are never logged at `info` or above; only field names and
//! event keys.

use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
    #[error("unknown log format '{0}': expected pretty, compact, or json")]
    UnknownFormat(String),
    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON lines for machine parsing.
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include the module path of each event.
    pub with_target: bool,
    pub with_ansi: bool,
    /// Let `RUST_LOG` override `level`.
    pub use_env_filter: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            with_target: false,
            with_ansi: true,
            use_env_filter: true,
        }
    }
}

impl LogConfig {
    /// Build from the textual level and format a CLI accepts.
    pub fn from_args(level: &str, format: &str) -> Result<Self, LoggingError> {
        let level = Level::from_str(level.trim())
            .map_err(|_| LoggingError::UnknownLevel(level.to_string()))?;
        Ok(Self {
            level,
            format: format.parse()?,
            ..Default::default()
        })
    }

    #[must_use]
    pub fn with_target(mut self, enable: bool) -> Self {
        self.with_target = enable;
        self
    }

    #[must_use]
    pub fn with_ansi(mut self, enable: bool) -> Self {
        self.with_ansi = enable;
        self
    }

    fn filter(&self) -> EnvFilter {
        let level = self.level.as_str().to_lowercase();
        let fallback = || EnvFilter::new(format!("warn,sae_narrative={level},narrate={level}"));
        if self.use_env_filter {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback())
        } else {
            fallback()
        }
    }
}

/// Install the global subscriber. Logs go to stderr so stdout carries only
/// narrative text.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.filter();
    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.with_ansi)
                    .with_target(config.with_target)
                    .without_time(),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.with_ansi)
                    .with_target(config.with_target),
            )
            .try_init(),
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
