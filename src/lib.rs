//! devicelink - device agent for a long-lived MQTT session
//!
//! This crate wires the `devicelink-mqtt` session library into a runnable
//! agent: it loads configuration, initializes logging, keeps the device
//! connected and reports its state periodically.
//!
//! ## Modules
//!
//! * `config` - Configuration structures, loading, validation, and defaults.
//!   Supports TOML configuration files with validation via the `validator` crate.
//!
//! * `logger` - Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON).
//!
//! * `reporter` - Periodic state report sent through the device, queued by
//!   the device while the broker is unreachable.

pub mod config;
pub mod logger;
pub mod reporter;
