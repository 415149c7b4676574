//! # devicelink-mqtt: persistent device session over MQTT 3.1.1
//!
//! One identified device keeps a long-lived, TLS-authenticated session with a
//! broker, reports state and receives commands. Layers, bottom-up:
//!
//! - [`codec`]: bit-exact packet encoding and an incremental decoder that
//!   reassembles packets split across reads
//! - [`verifier`] and [`tls`]: broker authentication against pinned trust
//!   anchors, with a hostname check after the handshake
//! - [`session`]: the I/O-free connection state machine
//!   (`connecting → handshaking_tls → connect_sent → connected → disconnecting → disconnected`)
//! - [`connection`]: the tokio task that drives a session over a socket and
//!   owns keep-alive timing
//! - [`device`]: identity, reconnect policy, offline backlog and command dispatch
//!
//! # Quick Start
//!
//! ```ignore
//! use devicelink_mqtt::{Device, DeviceConfig, DeviceEvent, DeviceIdentity};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = DeviceIdentity::new("my-device-id", "my-key", "my-secret")?;
//!     let (device, mut events) = Device::new(identity, DeviceConfig::default())?;
//!     device.connect().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             DeviceEvent::Connect | DeviceEvent::Reconnect => {
//!                 device.send_state(&json!({"temperature": 21.5}))?;
//!             }
//!             DeviceEvent::Command(command) => println!("command: {command}"),
//!             DeviceEvent::Fault(err) => return Err(err.into()),
//!             DeviceEvent::Close(_) => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Failure handling
//!
//! Every connection failure carries an [`ErrorKind`]. Authentication failures
//! are never retried. Everything else is retried only for a device that has
//! connected before and has `retry_lost_connection` enabled; otherwise the
//! failure is reported as [`DeviceEvent::Fault`].

pub mod backlog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod ext_json;
pub mod session;
pub mod state;
pub mod tls;
pub mod transport;
pub mod verifier;

pub use backlog::{normalize_timestamp, Backlog, StateRecord, Timestamp};
pub use codec::{Packet, PacketCodec, ProtocolVersion};
pub use config::{default_endpoint, set_default_endpoint, DeviceConfig};
pub use connection::Connection;
pub use device::{Device, DeviceEvent, DeviceEvents, DeviceIdentity};
pub use error::{CodecError, ConnectionError, DeviceError, ErrorKind, TrustStoreError};
pub use session::{ConnectionEvent, ConnectionOptions};
pub use state::ConnectionState;
pub use transport::{Connector, TcpConnector};
pub use verifier::{CertificateVerifier, TrustAnchors, TrustStore};
