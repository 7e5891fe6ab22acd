//! Logging setup
//!
//! Installs a global `tracing` subscriber. `RUST_LOG` overrides the
//! configured level when present.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::{Result, SurgeError};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = SurgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(SurgeError::Config(format!("unknown log level: {}", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for this crate; one of trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,
    /// Extra filter directives, e.g. "tokio=warn"
    #[serde(default)]
    pub directives: Vec<String>,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
    /// Print the event target (module path)
    #[serde(default = "default_with_target")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
}

fn default_level() -> String { "info".to_string() }
fn default_ansi() -> bool { true }
fn default_with_target() -> bool { true }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directives: Vec::new(),
            ansi: default_ansi(),
            with_target: default_with_target(),
            with_thread_ids: false,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level.as_str().to_string();
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn level(&self) -> Result<LogLevel> {
        self.level.parse()
    }

    /// Filter built from the configured level and directives
    pub fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = self.level()?.as_str().to_string();
        for directive in &self.directives {
            filter.push(',');
            filter.push_str(directive);
        }
        EnvFilter::try_new(&filter).map_err(|e| SurgeError::Config(format!("log filter {}: {}", filter, e)))
    }
}

/// Local wall-clock timestamps
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .try_init()
        .map_err(|e| SurgeError::Config(format!("install subscriber: {}", e)))?;

    let _ = INSTALLED.set(());
    tracing::debug!(level = %config.level, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_env_filter() {
        let config = LogConfig::default()
            .with_level(LogLevel::Debug)
            .with_directive("tokio=warn");
        assert!(config.env_filter().is_ok());

        let bad = LogConfig {
            level: "verbose".into(),
            ..Default::default()
        };
        assert!(matches!(bad.env_filter(), Err(SurgeError::Config(_))));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
