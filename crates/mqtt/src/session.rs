//! Protocol state machine for one broker connection, free of I/O.
//!
//! A [`Session`] is driven by the connection task (see [`connection`](crate::connection)):
//! the task reports transport facts (`transport_connected`, bytes received,
//! handshake outcome, socket closed, keep-alive ticks) and local requests
//! (publish, subscribe, close). The session answers by queueing outbound bytes,
//! queueing [`ConnectionEvent`]s, and raising [`wants_close`](Session::wants_close)
//! when the socket must be torn down.
//!
//! # Transitions
//!
//! | State            | Input                         | Next state / effect                          |
//! |------------------|-------------------------------|----------------------------------------------|
//! | `connecting`     | transport connected (plain)   | send Connect, `connect_sent`                 |
//! | `connecting`     | transport connected (secure)  | `handshaking_tls`                            |
//! | `handshaking_tls`| handshake done, host matches  | send Connect, `connect_sent`                 |
//! | `handshaking_tls`| chain or host rejected        | close with certificate error                 |
//! | `connect_sent`   | Connack 0                     | `connected`, keep-alive starts               |
//! | `connect_sent`   | Connack != 0                  | close with authentication error              |
//! | `connected`      | Publish                       | dispatch to the topic handler, if any        |
//! | `connected`      | Puback/Suback/Unsuback/Pingresp | none                                       |
//! | any              | any other packet              | close with protocol violation                |
//! | not closing      | local close                   | `disconnecting` (+ Disconnect if connected)  |
//! | any              | socket closed                 | `disconnected`                               |
//!
//! The session never retries. It reports the terminal reason upward in
//! [`ConnectionEvent::Disconnected`].

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use rustls::pki_types::CertificateDer;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    codec::{self, Connack, Connect, Packet, PacketCodec, ProtocolVersion, Publish, QoS},
    error::{CodecError, ConnectionError},
    state::ConnectionState,
    verifier,
};

/// Default keep-alive interval, in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 15;

/// Parameters of one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    /// Upgrade to TLS and verify the broker against the trust anchors.
    pub secure: bool,
    pub client_id: String,
    /// Seconds between keep-alive pings; 0 disables them.
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_version: ProtocolVersion,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            secure: false,
            client_id: generate_client_id(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            username: None,
            password: None,
            protocol_version: ProtocolVersion::V311,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

/// Random client identifier short enough for MQTT 3.1 brokers (23 chars max).
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("dl{}", &id[..16])
}

/// Lifecycle notifications of one connection, in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket connect issued.
    Connecting,
    /// Transport (and TLS, when secure) established; Connect packet sent.
    HandshakeDone,
    /// Broker accepted the credentials.
    Authenticated,
    /// Local close requested.
    Disconnecting,
    /// Connection finished. `None` means an orderly local close.
    Disconnected(Option<ConnectionError>),
}

pub type MessageHandler = Box<dyn FnMut(&str, Bytes) + Send>;

/// Exact-topic subscriptions, at most one handler per topic.
#[derive(Default)]
pub struct SubscriptionTable {
    handlers: HashMap<String, MessageHandler>,
}

impl SubscriptionTable {
    /// Registers `handler` for `topic`. Returns true if it replaced an existing handler.
    pub fn insert(&mut self, topic: impl Into<String>, handler: MessageHandler) -> bool {
        self.handlers.insert(topic.into(), handler).is_some()
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.handlers.remove(topic).is_some()
    }

    /// Runs the handler registered for `topic`. Returns false if there is none.
    pub fn dispatch(&mut self, topic: &str, payload: Bytes) -> bool {
        match self.handlers.get_mut(topic) {
            Some(handler) => {
                handler(topic, payload);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Maps the monotonically increasing local counter onto the 1..=65535 wire range.
pub fn wire_packet_id(counter: u64) -> u16 {
    ((counter.saturating_sub(1) % u64::from(u16::MAX)) + 1) as u16
}

/// Sans-IO state of one connection.
#[derive(Debug)]
pub struct Session {
    options: ConnectionOptions,
    state: ConnectionState,
    codec: PacketCodec,
    packet_id: u64,
    subscriptions: SubscriptionTable,
    last_received: Option<Instant>,
    failure: Option<ConnectionError>,
    outbound: BytesMut,
    events: VecDeque<ConnectionEvent>,
    close_requested: bool,
}

impl Session {
    /// Starts in `connecting`, with the `Connecting` event already queued.
    pub fn new(options: ConnectionOptions) -> Self {
        let mut events = VecDeque::new();
        events.push_back(ConnectionEvent::Connecting);
        Self {
            options,
            state: ConnectionState::Connecting,
            codec: PacketCodec::new(),
            packet_id: 0,
            subscriptions: SubscriptionTable::default(),
            last_received: None,
            failure: None,
            outbound: BytesMut::new(),
            events,
            close_requested: false,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failure(&self) -> Option<&ConnectionError> {
        self.failure.as_ref()
    }

    /// Number of packet identifiers consumed so far.
    pub fn packet_id(&self) -> u64 {
        self.packet_id
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// True once the socket must be shut down (failure or local close).
    pub fn wants_close(&self) -> bool {
        self.close_requested
    }

    /// Keep-alive period, only while connected with a nonzero keep-alive.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.state.is_connected() && self.options.keep_alive > 0 {
            Some(Duration::from_secs(u64::from(self.options.keep_alive)))
        } else {
            None
        }
    }

    /// Takes every byte queued for the socket since the last call.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// The socket is up. Plain connections send Connect right away.
    pub fn transport_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        if self.options.secure {
            debug!("Starting TLS handshake with {}", self.options.host);
            self.state = ConnectionState::HandshakingTls;
        } else {
            self.send_connect();
        }
    }

    /// TLS handshake finished; `peer` is the certificate the broker presented.
    ///
    /// The hostname is checked here, against that certificate, before any
    /// protocol byte is sent.
    pub fn handshake_completed(&mut self, peer: Option<&CertificateDer<'_>>) {
        if self.state != ConnectionState::HandshakingTls {
            return;
        }
        let verified = match peer {
            Some(cert) => verifier::verify_hostname(cert, &self.options.host),
            None => Err(ConnectionError::Certificate(format!(
                "Unable to verify the certificate for {}",
                self.options.host
            ))),
        };
        match verified {
            Ok(()) => self.send_connect(),
            Err(err) => self.fail(err),
        }
    }

    /// TLS handshake aborted (chain rejected or transport failure).
    pub fn handshake_failed(&mut self, err: ConnectionError) {
        self.fail(err);
    }

    /// Feeds bytes read from the socket, processing every completed packet.
    pub fn receive(&mut self, data: &[u8], now: Instant) {
        if self.close_requested || self.state.is_closing() {
            trace!("Ignoring {} bytes received while closing", data.len());
            return;
        }
        self.last_received = Some(now);

        match self.codec.feed(data) {
            Ok(packets) => {
                for packet in packets {
                    if self.close_requested {
                        break;
                    }
                    self.process_packet(packet);
                }
            }
            Err(err) => self.fail(err.into()),
        }
    }

    /// Periodic liveness check. Closes with a timeout if nothing arrived within
    /// one interval, else sends Pingreq.
    pub fn keep_alive_tick(&mut self, now: Instant) {
        if self.close_requested {
            return;
        }
        let Some(interval) = self.keep_alive_interval() else {
            return;
        };

        let idle = self
            .last_received
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if idle > interval {
            self.fail(ConnectionError::KeepAliveTimeout);
        } else if let Err(err) = self.queue(&Packet::Pingreq) {
            self.fail(err.into());
        }
    }

    /// Publishes `payload` to `topic` at QoS 0. Returns the packet identifier consumed.
    pub fn publish(&mut self, topic: &str, payload: Bytes) -> Result<u16, ConnectionError> {
        self.ensure_connected()?;
        let packet = Packet::Publish(Publish::at_most_once(topic, payload));
        let id = self.next_packet_id();
        self.queue(&packet)?;
        Ok(id)
    }

    /// Subscribes to `topic`, replacing any handler already registered for it.
    pub fn subscribe<F>(&mut self, topic: &str, handler: F) -> Result<u16, ConnectionError>
    where
        F: FnMut(&str, Bytes) + Send + 'static,
    {
        self.ensure_connected()?;
        let id = self.next_packet_id();
        self.queue(&Packet::Subscribe(codec::Subscribe {
            packet_id: id,
            filters: vec![(topic.to_string(), QoS::AtMostOnce)],
        }))?;
        self.subscriptions.insert(topic, Box::new(handler));
        Ok(id)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<u16, ConnectionError> {
        self.ensure_connected()?;
        self.subscriptions.remove(topic);
        let id = self.next_packet_id();
        self.queue(&Packet::Unsubscribe(codec::Unsubscribe {
            packet_id: id,
            filters: vec![topic.to_string()],
        }))?;
        Ok(id)
    }

    /// Orderly local close. Sends Disconnect only if currently connected.
    pub fn close(&mut self) {
        if self.state.is_closing() {
            return;
        }
        let was_connected = self.state.is_connected();
        self.state = ConnectionState::Disconnecting;
        self.events.push_back(ConnectionEvent::Disconnecting);
        if was_connected {
            if let Err(err) = self.queue(&Packet::Disconnect) {
                debug!("Could not queue Disconnect: {err}");
            }
        }
        self.close_requested = true;
    }

    /// Records `err` as the terminal reason (the first one wins) and requests teardown.
    pub fn fail(&mut self, err: ConnectionError) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.failure.is_none() {
            warn!("Closing connection to {}: {err}", self.options.host);
            self.failure = Some(err);
        }
        self.close_requested = true;
    }

    /// The socket is gone. Without a local close this is a failure.
    pub fn transport_closed(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.state != ConnectionState::Disconnecting && self.failure.is_none() {
            self.failure = Some(ConnectionError::ConnectionLost);
        }
        self.state = ConnectionState::Disconnected;
        self.close_requested = true;
        self.subscriptions.clear();
        self.events
            .push_back(ConnectionEvent::Disconnected(self.failure.clone()));
    }

    fn send_connect(&mut self) {
        let packet = Packet::Connect(Connect {
            protocol: self.options.protocol_version,
            client_id: self.options.client_id.clone(),
            keep_alive: self.options.keep_alive,
            clean_session: self.options.clean_session,
            username: self.options.username.clone(),
            password: self.options.password.clone(),
        });
        if let Err(err) = self.queue(&packet) {
            self.fail(err.into());
            return;
        }
        self.state = ConnectionState::ConnectSent;
        self.events.push_back(ConnectionEvent::HandshakeDone);
    }

    fn process_packet(&mut self, packet: Packet) {
        trace!("Received {} packet", packet.name());
        match (self.state, packet) {
            (ConnectionState::ConnectSent, Packet::Connack(ack)) => self.connect_ack(ack),
            (ConnectionState::Connected, Packet::Publish(publish)) => {
                if !self.subscriptions.dispatch(&publish.topic, publish.payload) {
                    trace!("No handler for topic {}, dropping message", publish.topic);
                }
            }
            (ConnectionState::Connected, Packet::Pingresp) => {}
            (
                ConnectionState::Connected,
                Packet::Puback(_) | Packet::Suback(_) | Packet::Unsuback(_),
            ) => {}
            (state, packet) => self.fail(ConnectionError::ProtocolViolation {
                packet: packet.name(),
                state,
            }),
        }
    }

    fn connect_ack(&mut self, ack: Connack) {
        if !ack.code.is_accepted() {
            self.fail(ConnectionError::Authentication(ack.code.to_string()));
            return;
        }
        info!("Authenticated with {}", self.options.host);
        self.state = ConnectionState::Connected;
        self.events.push_back(ConnectionEvent::Authenticated);
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.state.is_connected() && !self.close_requested {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        self.packet_id += 1;
        wire_packet_id(self.packet_id)
    }

    fn queue(&mut self, packet: &Packet) -> Result<(), CodecError> {
        let bytes = codec::encode(packet)?;
        trace!("Queued {} packet ({} bytes)", packet.name(), bytes.len());
        self.outbound.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        codec::{ConnectReturnCode, Suback},
        error::ErrorKind,
        verifier::fixtures::{cert, SERVER_CERT},
    };

    fn options(secure: bool) -> ConnectionOptions {
        ConnectionOptions {
            host: "broker.test.local".into(),
            port: if secure { 8883 } else { 1883 },
            secure,
            client_id: "device-1".into(),
            keep_alive: 15,
            clean_session: true,
            username: Some("key".into()),
            password: Some("secret".into()),
            protocol_version: ProtocolVersion::V311,
        }
    }

    fn sent(session: &mut Session) -> Vec<Packet> {
        match session.take_outbound() {
            Some(bytes) => PacketCodec::new().feed(&bytes).unwrap(),
            None => Vec::new(),
        }
    }

    fn events(session: &mut Session) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    fn connack(code: u8) -> Vec<u8> {
        codec::encode(&Packet::Connack(Connack {
            session_present: false,
            code: ConnectReturnCode::from(code),
        }))
        .unwrap()
        .to_vec()
    }

    fn connected_session() -> Session {
        let mut session = Session::new(options(false));
        session.transport_connected();
        session.receive(&connack(0), Instant::now());
        assert_eq!(session.state(), ConnectionState::Connected);
        session.take_outbound();
        events(&mut session);
        session
    }

    #[test]
    fn test_plain_transport_sends_connect() {
        let mut session = Session::new(options(false));
        session.transport_connected();

        assert_eq!(session.state(), ConnectionState::ConnectSent);
        match sent(&mut session).as_slice() {
            [Packet::Connect(connect)] => {
                assert_eq!(connect.client_id, "device-1");
                assert_eq!(connect.username.as_deref(), Some("key"));
                assert_eq!(connect.password.as_deref(), Some("secret"));
                assert_eq!(connect.keep_alive, 15);
                assert!(connect.clean_session);
            }
            other => panic!("unexpected packets {other:?}"),
        }
        assert_eq!(
            events(&mut session),
            vec![ConnectionEvent::Connecting, ConnectionEvent::HandshakeDone]
        );
    }

    #[test]
    fn test_secure_transport_waits_for_handshake() {
        let mut session = Session::new(options(true));
        session.transport_connected();
        assert_eq!(session.state(), ConnectionState::HandshakingTls);
        assert!(session.take_outbound().is_none());

        let peer = cert(SERVER_CERT);
        session.handshake_completed(Some(&peer));
        assert_eq!(session.state(), ConnectionState::ConnectSent);
        assert!(matches!(sent(&mut session).as_slice(), [Packet::Connect(_)]));
    }

    #[test]
    fn test_hostname_mismatch_aborts_before_connect() {
        let mut opts = options(true);
        opts.host = "other.test.local".into();
        let mut session = Session::new(opts);
        session.transport_connected();

        let peer = cert(SERVER_CERT);
        session.handshake_completed(Some(&peer));
        assert!(session.wants_close());
        assert!(session.take_outbound().is_none());

        session.transport_closed();
        let last = events(&mut session).pop().unwrap();
        assert_eq!(
            last,
            ConnectionEvent::Disconnected(Some(ConnectionError::Certificate(
                "The hostname other.test.local does not match the server certificate".into()
            )))
        );
    }

    #[test]
    fn test_handshake_failure_reports_certificate_error() {
        let mut session = Session::new(options(true));
        session.transport_connected();
        session.handshake_failed(ConnectionError::Certificate(
            "Unable to verify the certificate for broker.test.local".into(),
        ));
        session.transport_closed();

        assert!(session.take_outbound().is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            session.failure().map(ConnectionError::kind),
            Some(ErrorKind::Certificate)
        );
    }

    #[test]
    fn test_accepted_connack_authenticates() {
        let mut session = Session::new(options(false));
        session.transport_connected();
        events(&mut session);

        session.receive(&connack(0), Instant::now());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(events(&mut session), vec![ConnectionEvent::Authenticated]);
        assert_eq!(
            session.keep_alive_interval(),
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_refused_connack_is_authentication_failure() {
        let mut session = Session::new(options(false));
        session.transport_connected();
        session.receive(&connack(4), Instant::now());

        assert!(session.wants_close());
        assert_ne!(session.state(), ConnectionState::Connected);
        session.transport_closed();

        let reason = match events(&mut session).pop() {
            Some(ConnectionEvent::Disconnected(Some(reason))) => reason,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(reason.kind(), ErrorKind::Authentication);
        assert_eq!(
            reason.to_string(),
            "Authentication Error - Connection refused: bad user name or password"
        );
    }

    #[test]
    fn test_packet_ids_increase_and_reset_per_session() {
        let mut session = connected_session();
        assert_eq!(session.packet_id(), 0);
        assert_eq!(session.publish("s", Bytes::from_static(b"1")).unwrap(), 1);
        assert_eq!(session.subscribe("c", |_, _| {}).unwrap(), 2);
        assert_eq!(session.unsubscribe("c").unwrap(), 3);
        assert_eq!(session.packet_id(), 3);

        let packets = sent(&mut session);
        assert!(matches!(&packets[1], Packet::Subscribe(s) if s.packet_id == 2));
        assert!(matches!(&packets[2], Packet::Unsubscribe(u) if u.packet_id == 3));

        let mut fresh = connected_session();
        assert_eq!(fresh.publish("s", Bytes::new()).unwrap(), 1);
    }

    #[test]
    fn test_wire_packet_id_wraps() {
        assert_eq!(wire_packet_id(1), 1);
        assert_eq!(wire_packet_id(65_535), 65_535);
        assert_eq!(wire_packet_id(65_536), 1);
        assert_eq!(wire_packet_id(131_070), 65_535);
        assert_eq!(wire_packet_id(131_071), 1);
        assert_eq!(wire_packet_id(131_072), 2);
    }

    #[test]
    fn test_publish_requires_connected_state() {
        let mut session = Session::new(options(false));
        assert_eq!(
            session.publish("s", Bytes::new()),
            Err(ConnectionError::NotConnected)
        );
        session.transport_connected();
        assert_eq!(
            session.subscribe("c", |_, _| {}).map(|_| ()),
            Err(ConnectionError::NotConnected)
        );
        assert_eq!(session.packet_id(), 0);
    }

    #[test]
    fn test_publish_is_qos0_without_wire_id() {
        let mut session = connected_session();
        session
            .publish("devices/1/state", Bytes::from_static(b"{}"))
            .unwrap();
        assert_eq!(
            sent(&mut session),
            vec![Packet::Publish(Publish::at_most_once(
                "devices/1/state",
                Bytes::from_static(b"{}")
            ))]
        );
    }

    #[test]
    fn test_inbound_publish_dispatch() {
        let mut session = connected_session();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        session
            .subscribe(
                "devices/1/command",
                move |topic: &str, payload: Bytes| {
                    sink.lock().unwrap().push((topic.to_string(), payload));
                },
            )
            .unwrap();

        let mut inbound = Vec::new();
        for (topic, body) in [("devices/1/command", "on"), ("elsewhere", "off")] {
            inbound.extend_from_slice(
                &codec::encode(&Packet::Publish(Publish::at_most_once(
                    topic,
                    Bytes::from(body),
                )))
                .unwrap(),
            );
        }
        inbound.extend_from_slice(
            &codec::encode(&Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![0],
            }))
            .unwrap(),
        );
        session.receive(&inbound, Instant::now());

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[("devices/1/command".to_string(), Bytes::from_static(b"on"))]
        );
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.wants_close());
    }

    #[test]
    fn test_unexpected_packets_are_protocol_violations() {
        let mut session = connected_session();
        session.receive(&connack(0), Instant::now());
        assert!(session.wants_close());
        assert_eq!(
            session.failure().unwrap().to_string(),
            "Wasn't expecting packet of type Connack when in state connected"
        );

        let mut session = Session::new(options(false));
        session.transport_connected();
        session.receive(&[0xD0, 0x00], Instant::now());
        assert_eq!(
            session.failure(),
            Some(&ConnectionError::ProtocolViolation {
                packet: "Pingresp",
                state: ConnectionState::ConnectSent,
            })
        );
    }

    #[test]
    fn test_malformed_bytes_fail_with_protocol_error() {
        let mut session = connected_session();
        session.receive(&[0xF0, 0x00], Instant::now());
        assert_eq!(
            session.failure().map(ConnectionError::kind),
            Some(ErrorKind::Protocol)
        );
    }

    #[test]
    fn test_keep_alive_pings_then_times_out() {
        let start = Instant::now();
        let mut session = Session::new(options(false));
        session.transport_connected();
        session.receive(&connack(0), start);
        session.take_outbound();

        session.keep_alive_tick(start + Duration::from_secs(15));
        assert_eq!(sent(&mut session), vec![Packet::Pingreq]);
        assert!(!session.wants_close());

        session.keep_alive_tick(start + Duration::from_secs(30));
        assert!(session.wants_close());
        assert_eq!(session.failure(), Some(&ConnectionError::KeepAliveTimeout));
        assert!(session.take_outbound().is_none());
    }

    #[test]
    fn test_keep_alive_tick_ignored_outside_connected() {
        let mut session = Session::new(options(false));
        session.transport_connected();
        session.take_outbound();
        session.keep_alive_tick(Instant::now() + Duration::from_secs(60));
        assert!(session.take_outbound().is_none());
        assert!(!session.wants_close());
    }

    #[test]
    fn test_close_when_connected_sends_disconnect() {
        let mut session = connected_session();
        session.close();
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        assert_eq!(sent(&mut session), vec![Packet::Disconnect]);

        session.close();
        assert!(session.take_outbound().is_none());

        session.transport_closed();
        assert_eq!(
            events(&mut session),
            vec![
                ConnectionEvent::Disconnecting,
                ConnectionEvent::Disconnected(None)
            ]
        );
    }

    #[test]
    fn test_close_before_connack_sends_nothing() {
        let mut session = Session::new(options(false));
        session.transport_connected();
        session.take_outbound();

        session.close();
        assert!(session.take_outbound().is_none());
        session.transport_closed();
        assert_eq!(
            events(&mut session).pop(),
            Some(ConnectionEvent::Disconnected(None))
        );
    }

    #[test]
    fn test_unexpected_transport_close_is_connection_lost() {
        let mut session = connected_session();
        session
            .subscribe("devices/1/command", |_, _| {})
            .unwrap();
        assert_eq!(session.subscriptions().len(), 1);

        session.transport_closed();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.subscriptions().is_empty());
        assert_eq!(
            events(&mut session),
            vec![ConnectionEvent::Disconnected(Some(
                ConnectionError::ConnectionLost
            ))]
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let mut session = connected_session();
        session.fail(ConnectionError::KeepAliveTimeout);
        session.fail(ConnectionError::ConnectionLost);
        session.transport_closed();
        assert_eq!(session.failure(), Some(&ConnectionError::KeepAliveTimeout));
    }

    #[test]
    fn test_options_debug_redacts_password() {
        let rendered = format!("{:?}", options(false));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_generated_client_id_fits_v31_limit() {
        let id = generate_client_id();
        assert!(id.len() <= 23);
        assert_ne!(id, generate_client_id());
    }
}
