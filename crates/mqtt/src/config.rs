//! Device session settings.
//!
//! [`DeviceConfig`] is deserialized with serde (every field has a default, so an
//! empty table is a valid configuration) and checked with `validator` before a
//! device is built from it.
//!
//! The broker endpoint is resolved in two steps:
//! - `host` falls back to the process-wide [`default_endpoint`]
//! - `port` falls back to [`DEFAULT_SECURE_PORT`] or [`DEFAULT_PORT`] depending on `secure`
//!
//! # Examples
//!
//! ```toml
//! [device]
//! host = "broker.example.com"
//! secure = true
//! retry_delay = 10
//! state_topic = "fleet/{device_id}/state"
//! ```

use std::{
    path::Path,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    codec::ProtocolVersion,
    error::{DeviceError, TrustStoreError},
    session::DEFAULT_KEEP_ALIVE,
    verifier::TrustAnchors,
};

/// Broker port for plain connections.
pub const DEFAULT_PORT: u16 = 1883;
/// Broker port for TLS connections.
pub const DEFAULT_SECURE_PORT: u16 = 8883;
/// Placeholder substituted with the device id in topic templates.
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

static DEFAULT_ENDPOINT: Lazy<RwLock<String>> =
    Lazy::new(|| RwLock::new("localhost".to_string()));

/// Broker host used by devices whose configuration does not name one.
pub fn default_endpoint() -> String {
    DEFAULT_ENDPOINT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replaces the process-wide default broker host. Read on every connection attempt.
pub fn set_default_endpoint(host: impl Into<String>) {
    *DEFAULT_ENDPOINT
        .write()
        .unwrap_or_else(PoisonError::into_inner) = host.into();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DeviceConfig {
    /// Broker host. Defaults to [`default_endpoint`].
    #[validate(length(min = 1, max = 255, message = "Host must be between 1 and 255 characters"))]
    pub host: Option<String>,

    /// Broker port. Defaults to 8883 when `secure`, 1883 otherwise.
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: Option<u16>,

    /// Upgrade to TLS and verify the broker certificate.
    pub secure: bool,

    /// Reconnect after losing an established connection.
    pub retry_lost_connection: bool,

    /// Seconds to wait before a reconnect attempt.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Retry delay must be between 1 and 3600 seconds"
    ))]
    pub retry_delay: u64,

    /// Keep-alive interval in seconds, 0 disables keep-alive.
    pub keep_alive: u16,

    pub clean_session: bool,

    pub protocol_version: ProtocolVersion,

    /// Topic the broker publishes commands on.
    #[validate(custom(function = "validate_topic_template"))]
    pub command_topic: String,

    /// Topic state reports are published to.
    #[validate(custom(function = "validate_topic_template"))]
    pub state_topic: String,

    /// PEM bundle replacing the bundled root CA.
    #[validate(custom(function = "validate_ca_file"))]
    pub ca_file: Option<String>,

    /// Start a connection when state is sent while no connection exists.
    pub connect_on_send: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            secure: true,
            retry_lost_connection: true,
            retry_delay: 5,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            protocol_version: ProtocolVersion::default(),
            command_topic: "devices/{device_id}/command".to_string(),
            state_topic: "devices/{device_id}/state".to_string(),
            ca_file: None,
            connect_on_send: true,
        }
    }
}

impl DeviceConfig {
    pub fn resolve_host(&self) -> String {
        self.host.clone().unwrap_or_else(default_endpoint)
    }

    pub fn resolve_port(&self) -> u16 {
        match (self.port, self.secure) {
            (Some(port), _) => port,
            (None, true) => DEFAULT_SECURE_PORT,
            (None, false) => DEFAULT_PORT,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn command_topic_for(&self, device_id: &str) -> String {
        self.command_topic.replace(DEVICE_ID_PLACEHOLDER, device_id)
    }

    pub fn state_topic_for(&self, device_id: &str) -> String {
        self.state_topic.replace(DEVICE_ID_PLACEHOLDER, device_id)
    }

    /// Roots for certificate verification: `ca_file` when set, else the bundled CA.
    pub fn trust_anchors(&self) -> Result<TrustAnchors, TrustStoreError> {
        match &self.ca_file {
            Some(path) => TrustAnchors::from_pem_file(path),
            None => TrustAnchors::bundled(),
        }
    }

    /// Validates the settings, flattening every failure into one message.
    pub fn check(&self) -> Result<(), DeviceError> {
        self.validate().map_err(|e| DeviceError::Config(describe(&e)))
    }
}

/// `field: message` pairs in field order.
fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |err| match &err.message {
                Some(message) => format!("{field}: {message}"),
                None => format!("{field}: {}", err.code),
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn validate_topic_template(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        let mut err = ValidationError::new("invalid_topic");
        err.message = Some(format!("Invalid topic template: {topic:?}").into());
        return Err(err);
    }
    if !topic.contains(DEVICE_ID_PLACEHOLDER) {
        let mut err = ValidationError::new("missing_device_id");
        err.message = Some(
            format!("Topic template {topic:?} must contain {DEVICE_ID_PLACEHOLDER}").into(),
        );
        return Err(err);
    }
    Ok(())
}

fn validate_ca_file(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        let mut err = ValidationError::new("empty_path");
        err.message = Some("CA file path cannot be empty".into());
        return Err(err);
    }
    if !Path::new(path).exists() {
        let mut err = ValidationError::new("file_not_found");
        err.message = Some(format!("CA file not found: {path}").into());
        return Err(err);
    }
    Ok(())
}
