//! Structured Logging
//!
//! JSON output for production, pretty output for development. `RUST_LOG`
//! takes precedence over the configured filter.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Log level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
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
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    #[default]
    Pretty,
    /// JSON for production
    Json,
    /// Compact single-line
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Emit file and line of each event
    pub include_source: bool,
    pub include_thread_id: bool,
    pub include_span_events: bool,
    /// Filter directives (e.g. "fleet_api=debug,tower_http=warn")
    pub filter: Option<String>,
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_source: false,
            include_thread_id: false,
            include_span_events: false,
            filter: None,
            service_name: "fleet".to_string(),
        }
    }
}

impl LogConfig {
    /// JSON lines with thread ids and span open/close events
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            include_thread_id: true,
            include_span_events: true,
            ..Self::default()
        }
    }

    /// Filter directives used when `RUST_LOG` is unset
    pub fn directives(&self) -> String {
        match &self.filter {
            Some(filter) => filter.clone(),
            None => format!("{},hyper=warn,h2=warn", self.level),
        }
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())?,
    };

    let layer = fmt::layer()
        .with_span_events(match config.include_span_events {
            true => FmtSpan::NEW | FmtSpan::CLOSE,
            false => FmtSpan::NONE,
        })
        .with_thread_ids(config.include_thread_id)
        .with_file(config.include_source)
        .with_line_number(config.include_source);

    match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(filter).with(layer.json());
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(filter).with(layer.pretty());
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry().with(filter).with(layer.compact());
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    tracing::info!(service = %config.service_name, format = ?config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_http_internals() {
        let defaults = LogConfig::default();
        assert_eq!(defaults.directives(), "info,hyper=warn,h2=warn");

        let verbose = LogConfig {
            level: LogLevel::Trace,
            ..LogConfig::default()
        };
        assert_eq!(verbose.directives(), "trace,hyper=warn,h2=warn");
    }

    #[test]
    fn test_production_profile_is_json() {
        let production = LogConfig::production();
        assert_eq!(production.format, LogFormat::Json);
        assert!(production.include_thread_id && production.include_span_events);
        assert_eq!(production.service_name, "fleet");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = LogConfig {
            filter: Some("fleet_api=debug".into()),
            ..LogConfig::default()
        };
        assert_eq!(config.directives(), "fleet_api=debug");
    }
}
