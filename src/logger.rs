//! Centralized logging configuration and initialization manager.
//!
//! The `LoggerManager` validates logging configuration and initializes
//! the global `tracing` subscriber with a console layer. It supports multiple
//! log formats, configurable timestamps, ANSI coloring, thread/span
//! information, and environment-based filtering (`RUST_LOG` wins over the
//! configured level).

use std::{
    fmt::{self as stdfmt},
    io,
};

use thiserror::Error;
use time::{
    format_description::{well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_warn,
};

/// Errors that can occur during logger configuration or initialization.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// General initialization failure with a descriptive message.
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    /// Validation errors from the logger configuration struct.
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// No output layers were successfully configured.
    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,
}

/// Timestamp writer driven by [`TimestampFormat`].
#[derive(Debug, Clone)]
enum LogTimer {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl LogTimer {
    fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => LogTimer::Rfc3339,
            TimestampFormat::Unix => LogTimer::Unix,
            TimestampFormat::Custom(description) => LogTimer::Custom(
                time::format_description::parse_owned::<1>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
            ),
        })
    }

    fn render(&self, now: OffsetDateTime) -> Result<String, stdfmt::Error> {
        match self {
            LogTimer::Rfc3339 => now.format(&Rfc3339).map_err(|_| stdfmt::Error),
            LogTimer::Unix => Ok(format!(
                "{}.{:06}",
                now.unix_timestamp(),
                now.microsecond()
            )),
            LogTimer::Custom(format) => now.format(format).map_err(|_| stdfmt::Error),
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> stdfmt::Result {
        write!(w, "{}", self.render(OffsetDateTime::now_utc())?)
    }
}

/// Manages logging configuration and global subscriber initialization.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Creates a new `LoggerManager` and validates the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if configuration validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Initializes the global `tracing` subscriber.
    ///
    /// Must be called once at startup, before any tracing macros are used.
    ///
    /// # Errors
    ///
    /// Returns an error if console output is disabled or the subscriber
    /// cannot be installed.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers = Vec::new();
        match &self.config.console {
            Some(console_config) if console_config.enabled => {
                let console_filter = EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

                let console_layer = self.init_console_logger(console_config, console_filter)?;
                layers.push(console_layer);
            }
            _ => {}
        }
        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    /// Constructs a console output layer according to the provided configuration.
    fn init_console_logger(
        &self,
        config: &ConsoleConfig,
        filter: EnvFilter,
    ) -> Result<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>, LoggerError> {
        let writer = io::stdout;
        let timer = LogTimer::new(&self.config.timestamp_format)?;
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_span_events(span_events)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_timer(timer)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_span_events(span_events)
                .with_ansi(config.ansi_colors)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_timer(timer)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_span_events(span_events)
                .with_ansi(config.ansi_colors)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        };

        Ok(layer)
    }
}
