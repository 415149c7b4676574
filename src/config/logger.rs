//! Logging configuration structures and validation logic.
//!
//! This module defines the configuration types used for initializing the
//! agent's logging subsystem. All structures support serialization
//! and deserialization via `serde` and include validation rules enforced
//! by the `validator` crate.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Available formats for console log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "json")]
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Compact
    }
}

/// Formats available for timestamp representation in log entries.
///
/// `Custom` takes a `time` format description, e.g.
/// `"[hour]:[minute]:[second].[subsecond digits:3]"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimestampFormat {
    #[serde(rename = "rfc3339")]
    Rfc3339,
    #[serde(rename = "unix")]
    Unix,
    #[serde(rename = "custom")]
    Custom(String),
}

impl Default for TimestampFormat {
    fn default() -> Self {
        TimestampFormat::Rfc3339
    }
}

/// Top-level logging configuration.
///
/// Controls global log level, timestamp format, and console output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level. Valid values: trace, debug, info, warn, error (case-insensitive).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Optional console output configuration.
    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    /// Timestamp format used across all outputs.
    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

/// Validates that a custom timestamp format string is non-empty and parses.
fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    match format {
        TimestampFormat::Custom(s) if s.is_empty() => {
            let mut err = ValidationError::new("invalid_timestamp_format");
            err.message = Some("Custom timestamp format cannot be empty".into());
            Err(err)
        }
        TimestampFormat::Custom(s) => match time::format_description::parse_owned::<1>(s) {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut err = ValidationError::new("invalid_timestamp_format");
                err.message = Some(format!("Invalid timestamp format '{s}': {e}").into());
                Err(err)
            }
        },
        _ => Ok(()),
    }
}

/// Validates that the provided log level is one of the supported values.
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            timestamp_format: TimestampFormat::default(),
            console: Some(ConsoleConfig::default()),
        }
    }
}

/// Configuration for console log output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Whether console output is enabled.
    pub enabled: bool,

    /// Output format for console logs.
    #[serde(default)]
    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    /// Include thread IDs in output.
    pub show_thread_ids: bool,

    /// Include span entry/exit events in output.
    pub show_spans: bool,

    /// Enable ANSI color codes in console output.
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logger_config_is_valid() {
        let config = LoggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timestamp_format, TimestampFormat::Rfc3339);
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let config = LoggerConfig {
            level: "DEBUG".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_timestamp_format() {
        let valid = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour]:[minute]:[second]".into()),
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let invalid = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour".into()),
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        let empty = LoggerConfig {
            timestamp_format: TimestampFormat::Custom(String::new()),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }
}
