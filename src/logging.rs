//! Logging System
//!
//! Structured logging via the `tracing` crate. The node process initializes
//! this once at startup; level, format, destination, and per-module
//! overrides come from [`LoggingConfig`].

use crate::error::BlobberError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Whether logging is enabled (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text (default: text)
    #[serde(default = "default_format")]
    pub format: String,

    /// Output destination: stderr, file
    #[serde(default = "default_output")]
    pub output: String,

    /// Log file path when output is file
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Enable colored output (text format, stderr only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Module-specific log levels
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log/blobber.log")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: default_log_file(),
            color: true,
            modules: HashMap::new(),
        }
    }
}

/// Build the env-filter directive string from the base level plus
/// module-specific overrides. `BLOBBER_LOG` takes precedence over both.
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    if let Ok(env) = std::env::var("BLOBBER_LOG") {
        if !env.is_empty() {
            return env;
        }
    }
    let mut directives = vec![config.level.clone()];
    for (module, level) in &config.modules {
        directives.push(format!("{module}={level}"));
    }
    directives.join(",")
}

/// Initialize the global tracing subscriber.
///
/// Returns `Ok(())` without installing anything when logging is disabled.
/// Initializing twice is an error surfaced by the subscriber registry.
pub fn init_logging(config: &LoggingConfig) -> Result<(), BlobberError> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_new(build_filter_directives(config))
        .map_err(|e| BlobberError::Config(format!("invalid log filter: {e}")))?;

    match (config.output.as_str(), config.format.as_str()) {
        ("file", format) => {
            if let Some(parent) = config.file.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BlobberError::Config(format!(
                        "create log directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file)
                .map_err(|e| {
                    BlobberError::Config(format!("open log file {}: {e}", config.file.display()))
                })?;
            let writer = Arc::new(file);
            if format == "json" {
                let layer = fmt::layer()
                    .json()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(writer);
                Registry::default()
                    .with(filter)
                    .with(layer)
                    .try_init()
                    .map_err(|e| BlobberError::Config(format!("logging init: {e}")))?;
            } else {
                let layer = fmt::layer()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(writer);
                Registry::default()
                    .with(filter)
                    .with(layer)
                    .try_init()
                    .map_err(|e| BlobberError::Config(format!("logging init: {e}")))?;
            }
        }
        (_, "json") => {
            let layer = fmt::layer()
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(std::io::stderr);
            Registry::default()
                .with(filter)
                .with(layer)
                .try_init()
                .map_err(|e| BlobberError::Config(format!("logging init: {e}")))?;
        }
        _ => {
            let layer = fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(config.color)
                .with_writer(std::io::stderr);
            Registry::default()
                .with(filter)
                .with(layer)
                .try_init()
                .map_err(|e| BlobberError::Config(format!("logging init: {e}")))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_text_stderr_info() {
        let config = LoggingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "text");
        assert_eq!(config.output, "stderr");
    }

    #[test]
    fn filter_directives_include_module_overrides() {
        let mut config = LoggingConfig::default();
        config
            .modules
            .insert("blobber::store".to_string(), "debug".to_string());
        let directives = build_filter_directives(&config);
        assert!(directives.starts_with("info"));
        assert!(directives.contains("blobber::store=debug"));
    }

    #[test]
    fn disabled_logging_is_a_no_op() {
        let config = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        init_logging(&config).unwrap();
    }
}
