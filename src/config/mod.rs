//! Application configuration loading, validation, and management.
//!
//! This module provides the top-level `Config` structure that aggregates
//! logging, device identity, session, and report configurations. It handles
//! loading from TOML files and validation.
//!
//! The configuration is loaded early in the application lifecycle and is
//! intended to remain immutable thereafter.
//!
//! # Example
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [identity]
//! device_id = "5f8e3c2a"
//! key = "access-key"
//! secret = "access-secret"
//!
//! [device]
//! host = "broker.example.com"
//! retry_delay = 5
//!
//! [report]
//! interval = 30
//! attributes = { site = "lab-2" }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use devicelink_mqtt::{DeviceConfig, DeviceIdentity};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::config::{logger::LoggerConfig, report::ReportConfig};

pub mod logger;
pub mod report;

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Current UTC time for the `print_*` macros, microsecond precision.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Errors that can occur during configuration loading, parsing, or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
///
/// Only `identity` is required; every other section falls back to defaults.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
pub struct Config {
    /// Logging subsystem configuration.
    #[serde(default)]
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Device credentials issued by the platform.
    #[validate(nested)]
    pub identity: DeviceIdentity,

    /// Broker endpoint, retry policy and topics.
    #[serde(default)]
    #[validate(nested)]
    pub device: DeviceConfig,

    /// Periodic state report.
    #[serde(default)]
    #[validate(nested)]
    pub report: ReportConfig,
}

impl Config {
    /// Constructs a new configuration by locating and loading the config file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `DEVICELINK_CONFIG` environment variable
    /// 2. `/etc/devicelink/config.toml`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Config` if no suitable file is found.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("DEVICELINK_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from DEVICELINK_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/devicelink/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}
