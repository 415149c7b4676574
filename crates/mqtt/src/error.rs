//! Error types for the device session stack.
//!
//! Each layer has its own error enum:
//!
//! - [`CodecError`]: malformed bytes on the wire, or a packet that cannot be encoded
//! - [`TrustStoreError`]: trust anchors that cannot be loaded or parsed
//! - [`ConnectionError`]: the terminal reason a connection ended (or a refused operation)
//! - [`DeviceError`]: everything the public [`Device`](crate::Device) API can return
//!
//! # Fatal vs retryable
//!
//! A disconnection reason is classified through [`ConnectionError::kind`]. The device
//! reconnect policy only ever looks at that classification, never at message text:
//!
//! ```ignore
//! match reason.kind() {
//!     ErrorKind::Authentication => { /* credentials rejected, never retry */ }
//!     _ => { /* transient, retry if the device was connected before */ }
//! }
//! ```

use std::io;

use thiserror::Error;

use crate::state::ConnectionState;

/// Errors produced while encoding or decoding protocol packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The remaining-length field continued past its fourth byte.
    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    /// The packet body does not fit in the largest remaining length the protocol allows.
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// The packet type nibble is 0 or 15.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// The fixed-header flags are not the ones mandated for the packet type.
    #[error("Invalid flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    /// The packet body is truncated or carries trailing garbage.
    #[error("Malformed {0} packet")]
    Malformed(&'static str),

    /// A length-prefixed string is not valid UTF-8.
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    /// A string is longer than a 16-bit length prefix can describe.
    #[error("String too long: {0} bytes")]
    StringTooLong(usize),

    /// QoS bits set to 3.
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    /// A QoS 1/2 publish (or a subscribe/unsubscribe) without a packet identifier.
    #[error("Missing packet identifier")]
    MissingPacketId,

    /// Connect packet names a protocol this codec does not speak.
    #[error("Unsupported protocol {name} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },
}

/// Errors raised while loading or extending a certificate trust store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustStoreError {
    /// The CA file could not be read.
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    /// The PEM input contained no certificate blocks.
    #[error("No certificates found in {0}")]
    NoCertificates(String),

    /// A certificate could not be parsed into a trust anchor.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// Coarse classification of a [`ConnectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broker refused the credentials (nonzero Connack return code).
    Authentication,
    /// Certificate chain or hostname verification failed.
    Certificate,
    /// Peer sent an unexpected or malformed packet.
    Protocol,
    /// Socket closed, reset or unreachable.
    TransportLost,
    /// Nothing received within the keep-alive window.
    KeepAliveTimeout,
    /// Operation requires an authenticated connection.
    NotConnected,
}

/// The reason a connection ended, or why an operation on it was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The broker answered the Connect packet with a refusal.
    ///
    /// Carries the human-readable description of the return code. Never retried.
    #[error("Authentication Error - {0}")]
    Authentication(String),

    /// Chain verification or post-handshake hostname verification failed.
    #[error("{0}")]
    Certificate(String),

    /// A packet arrived that is not valid in the current state.
    #[error("Wasn't expecting packet of type {packet} when in state {state}")]
    ProtocolViolation {
        packet: &'static str,
        state: ConnectionState,
    },

    /// Inbound bytes could not be decoded.
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    /// The socket closed without an orderly local disconnect.
    #[error("Connection to server lost")]
    ConnectionLost,

    /// No bytes were received from the peer within the keep-alive interval.
    #[error("Keep alive failure, disconnecting")]
    KeepAliveTimeout,

    /// Publish/subscribe attempted outside the connected state.
    #[error("Not connected")]
    NotConnected,

    /// I/O failure on the socket (connect refused, reset, TLS alert...).
    #[error("Transport error: {message}")]
    Transport { kind: io::ErrorKind, message: String },
}

impl ConnectionError {
    /// Classifies this error for the reconnect policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Authentication(_) => ErrorKind::Authentication,
            ConnectionError::Certificate(_) => ErrorKind::Certificate,
            ConnectionError::ProtocolViolation { .. } | ConnectionError::Codec(_) => {
                ErrorKind::Protocol
            }
            ConnectionError::ConnectionLost | ConnectionError::Transport { .. } => {
                ErrorKind::TransportLost
            }
            ConnectionError::KeepAliveTimeout => ErrorKind::KeepAliveTimeout,
            ConnectionError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Returns false only for credential refusals. Certificate failures are retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Authentication
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors returned by the [`Device`](crate::Device) API.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Identity rejected at construction ("Invalid Device Id", "Invalid Key", "Invalid Secret").
    #[error("{0}")]
    Validation(String),

    /// Device settings failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection could not be opened and no retry applies.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The state value could not be serialized to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Trust anchors could not be loaded.
    #[error("Trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    /// The device task is gone; the handle is unusable.
    #[error("Device kernel stopped")]
    KernelStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_error_display() {
        let err = ConnectionError::Authentication(
            "Connection refused: bad user name or password".into(),
        );
        assert_eq!(
            err.to_string(),
            "Authentication Error - Connection refused: bad user name or password"
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_protocol_violation_display() {
        let err = ConnectionError::ProtocolViolation {
            packet: "Connack",
            state: ConnectionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Wasn't expecting packet of type Connack when in state connected"
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err: ConnectionError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::TransportLost);
        assert!(err.to_string().contains("connection refused"));
        assert!(matches!(
            err,
            ConnectionError::Transport {
                kind: io::ErrorKind::ConnectionRefused,
                ..
            }
        ));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ConnectionError::ConnectionLost.is_retryable());
        assert!(ConnectionError::KeepAliveTimeout.is_retryable());
        assert!(ConnectionError::Certificate("bad chain".into()).is_retryable());
        assert!(ConnectionError::Codec(CodecError::MalformedRemainingLength).is_retryable());
        assert_eq!(
            ConnectionError::KeepAliveTimeout.kind(),
            ErrorKind::KeepAliveTimeout
        );
    }

    #[test]
    fn test_device_error_wraps_connection_error() {
        let err: DeviceError = ConnectionError::ConnectionLost.into();
        assert_eq!(err.to_string(), "Connection to server lost");
        assert!(matches!(
            err,
            DeviceError::Connection(ConnectionError::ConnectionLost)
        ));
    }

    #[test]
    fn test_codec_error_flags_display() {
        let err = CodecError::InvalidFlags {
            packet_type: 8,
            flags: 0,
        };
        assert_eq!(err.to_string(), "Invalid flags 0b0000 for packet type 8");
    }
}
