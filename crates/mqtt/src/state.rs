//! Connection lifecycle states.
//!
//! A connection moves strictly forward through these states:
//!
//! ```text
//! connecting -> handshaking_tls -> connect_sent -> connected -> disconnecting -> disconnected
//!          \______(plain TCP)_____/        |                                   ^
//!                    |                     +--(auth refused)-------------------+
//!                    +--(certificate rejected)---------------------------------+
//! ```
//!
//! `disconnected` is terminal for a connection instance; the device opens a new
//! connection (starting again at `connecting`) to go around the cycle.
//!
//! The current state is published on a watch channel by the connection driver.
//!
//! # Examples
//!
//! ```ignore
//! use devicelink_mqtt::ConnectionState;
//!
//! let state = ConnectionState::ConnectSent;
//! println!("Status: {}", state);  // "connect_sent"
//! assert!(!state.is_connected());
//! ```

use std::fmt;

/// Represents the current state of one broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket connect issued, not yet established.
    Connecting,

    /// Socket established, TLS handshake in progress.
    ///
    /// The peer chain is checked against the trust store while in this state.
    HandshakingTls,

    /// Connect packet sent, waiting for Connack.
    ///
    /// Only a Connack is acceptable here.
    ConnectSent,

    /// Broker accepted the credentials.
    ///
    /// Publishes and subscriptions are only possible in this state, and the
    /// keep-alive timer only runs while here.
    Connected,

    /// Local close requested, teardown in progress.
    Disconnecting,

    /// Terminal. Socket and timers released.
    Disconnected,
}

impl ConnectionState {
    /// Returns the snake_case name of the state.
    ///
    /// # Examples
    /// ```ignore
    /// assert_eq!(ConnectionState::HandshakingTls.as_str(), "handshaking_tls");
    /// ```
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakingTls => "handshaking_tls",
            ConnectionState::ConnectSent => "connect_sent",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// True only in `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True for `Disconnecting` and `Disconnected`.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
