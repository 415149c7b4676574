//! Tokio driver for one broker connection.
//!
//! [`open`] awaits the transport connect (so an unreachable broker fails the
//! call itself), then spawns a task that owns the socket and the [`Session`].
//! The task runs one `select!` loop over:
//!
//! - commands from the [`Connection`] handle (publish, subscribe, unsubscribe, close)
//! - bytes read from the socket
//! - the keep-alive interval, which only exists while the session is connected
//!
//! ```text
//! Device kernel
//!     | commands (mpsc)                 ^ ConnectionEvent (mpsc)
//!     v                                 |
//! Connection task ---- Session (state machine, codec, subscriptions)
//!     |
//!     v
//! BoxedStream (TCP, optionally wrapped in TLS)
//! ```
//!
//! The current [`ConnectionState`] is published on a watch channel; it is
//! updated before the events of the same step are delivered, so a listener that
//! receives `Authenticated` already sees `connected`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, watch},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, trace};

use crate::{
    error::ConnectionError,
    session::{ConnectionEvent, ConnectionOptions, MessageHandler, Session},
    state::ConnectionState,
    tls,
    transport::{BoxedStream, Connector},
    verifier::{CertificateVerifier, TrustAnchors, TrustStore},
};

const READ_BUFFER_SIZE: usize = 4096;

enum Command {
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String, handler: MessageHandler },
    Unsubscribe { topic: String },
    Close,
}

/// Handle to a running connection task.
///
/// Dropping every clone of the handle closes the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

/// Opens a connection and starts its driver task.
///
/// # Arguments
/// - `options`: endpoint, credentials and protocol settings
/// - `connector`: transport factory
/// - `anchors`: roots the per-attempt trust store is seeded from (unused when not secure)
/// - `events`: receives every [`ConnectionEvent`] of this connection, ending with
///   `Disconnected`
///
/// # Errors
/// Fails only if the transport connect itself fails. Everything after that
/// (TLS rejection, refused credentials, lost socket) is reported through
/// `ConnectionEvent::Disconnected`.
///
/// # Examples
/// ```ignore
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let connection = connection::open(options, &TcpConnector, &anchors, tx).await?;
/// while let Some(event) = rx.recv().await {
///     if event == ConnectionEvent::Authenticated {
///         connection.publish("devices/1/state", "{}")?;
///     }
/// }
/// ```
pub async fn open(
    options: ConnectionOptions,
    connector: &dyn Connector,
    anchors: &TrustAnchors,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<Connection, ConnectionError> {
    let verifier = if options.secure {
        let store =
            TrustStore::new(anchors).map_err(|e| ConnectionError::Certificate(e.to_string()))?;
        Some(Arc::new(CertificateVerifier::new(store, options.host.clone())))
    } else {
        None
    };

    let mut session = Session::new(options);
    let host = session.options().host.clone();
    let port = session.options().port;
    while let Some(event) = session.poll_event() {
        let _ = events.send(event);
    }

    debug!("Connecting to {host}:{port}");
    let stream = connector.connect(&host, port).await?;

    let (state_tx, state_rx) = watch::channel(session.state());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        session,
        events,
        state: state_tx,
        keep_alive: None,
    };
    tokio::spawn(driver.run(stream, verifier, commands_rx));

    Ok(Connection {
        commands: commands_tx,
        state: state_rx,
    })
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch channel following this connection's state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Publishes at QoS 0.
    ///
    /// # Errors
    /// `NotConnected` unless the connection is authenticated.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.send(Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
        })
    }

    /// Subscribes to an exact topic. `handler` runs on the connection task for
    /// every message published to it.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<(), ConnectionError>
    where
        F: FnMut(&str, Bytes) + Send + 'static,
    {
        self.ensure_connected()?;
        self.send(Command::Subscribe {
            topic: topic.into(),
            handler: Box::new(handler),
        })
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.send(Command::Unsubscribe {
            topic: topic.into(),
        })
    }

    /// Requests an orderly close. The final `Disconnected(None)` event follows.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn send(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::NotConnected)
    }
}

struct Driver {
    session: Session,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    keep_alive: Option<Interval>,
}

impl Driver {
    async fn run(
        mut self,
        stream: BoxedStream,
        verifier: Option<Arc<CertificateVerifier>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        self.session.transport_connected();
        self.sync();

        let mut stream = match (self.session.state(), verifier) {
            (ConnectionState::HandshakingTls, Some(verifier)) => {
                match tls::start_tls(stream, verifier).await {
                    Ok((tls, peer)) => {
                        self.session.handshake_completed(peer.as_ref());
                        Box::new(tls) as BoxedStream
                    }
                    Err(err) => {
                        self.session.handshake_failed(err);
                        self.finish();
                        return;
                    }
                }
            }
            _ => stream,
        };

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(bytes) = self.session.take_outbound() {
                if let Err(err) = write_all(&mut stream, &bytes).await {
                    self.session.fail(err.into());
                }
            }
            self.sync();

            if self.session.wants_close() {
                if let Err(err) = stream.shutdown().await {
                    trace!("Socket shutdown failed: {err}");
                }
                break;
            }

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.session.close(),
                },
                read = stream.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Socket closed by peer");
                        break;
                    }
                    Ok(n) => self.session.receive(&buf[..n], Instant::now()),
                    Err(err) => self.session.fail(err.into()),
                },
                _ = tick(&mut self.keep_alive) => self.session.keep_alive_tick(Instant::now()),
            }
        }

        self.finish();
    }

    fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Publish { topic, payload } => self.session.publish(&topic, payload).map(drop),
            Command::Subscribe { topic, handler } => {
                self.session.subscribe(&topic, handler).map(drop)
            }
            Command::Unsubscribe { topic } => self.session.unsubscribe(&topic).map(drop),
            Command::Close => {
                self.session.close();
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!("Dropping command: {err}");
        }
    }

    fn finish(&mut self) {
        self.session.transport_closed();
        self.sync();
    }

    /// Publishes the state, arms or disarms keep-alive, then forwards queued events.
    fn sync(&mut self) {
        let state = self.session.state();
        if *self.state.borrow() != state {
            info!("Connection state changed to: {state}");
            self.state.send_replace(state);
        }

        match self.session.keep_alive_interval() {
            Some(period) if self.keep_alive.is_none() => {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keep_alive = Some(interval);
            }
            Some(_) => {}
            None => self.keep_alive = None,
        }

        while let Some(event) = self.session.poll_event() {
            if self.events.send(event).is_err() {
                trace!("No listener for connection events");
            }
        }
    }
}

async fn write_all(stream: &mut BoxedStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::test_broker::Broker;
    use super::*;
    use crate::{
        codec::{Packet, Publish, Suback},
        error::ErrorKind,
        tls::test_server::acceptor,
        transport::mock::MockConnector,
        verifier::fixtures::*,
    };

    fn options(secure: bool) -> ConnectionOptions {
        ConnectionOptions {
            host: "broker.test.local".into(),
            port: if secure { 8883 } else { 1883 },
            secure,
            client_id: "device-1".into(),
            keep_alive: 15,
            username: Some("key".into()),
            password: Some("secret".into()),
            ..Default::default()
        }
    }

    async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    async fn wait_for(
        events: &mut UnboundedReceiver<ConnectionEvent>,
        wanted: fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        loop {
            let event = next_event(events).await;
            if wanted(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_open_fails_when_transport_connect_fails() {
        let (connector, _brokers) = MockConnector::new();
        connector.fail_next(io::ErrorKind::ConnectionRefused);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportLost);
        assert_eq!(
            connector.attempts(),
            vec![("broker.test.local".to_string(), 1883)]
        );
    }

    #[tokio::test]
    async fn test_plain_lifecycle_and_orderly_close() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        let watcher = connection.subscribe_state();

        let connect = broker.accept(0).await;
        assert_eq!(connect.client_id, "device-1");
        assert_eq!(connect.username.as_deref(), Some("key"));

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connecting);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::HandshakeDone);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Authenticated);
        assert!(connection.is_connected());

        connection.publish("devices/1/state", "{}").unwrap();
        assert_eq!(
            broker.recv().await,
            Some(Packet::Publish(Publish::at_most_once(
                "devices/1/state",
                Bytes::from_static(b"{}")
            )))
        );

        connection.close();
        assert_eq!(broker.recv().await, Some(Packet::Disconnect));
        assert_eq!(broker.recv().await, None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnecting);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(None)
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(*watcher.borrow(), ConnectionState::Disconnected);
        assert_eq!(
            connection.publish("devices/1/state", "{}"),
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_subscription_handler_receives_messages() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(0).await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Authenticated).await;

        let (msg_tx, mut messages) = mpsc::unbounded_channel();
        connection
            .subscribe("devices/1/command", move |topic: &str, payload: Bytes| {
                let _ = msg_tx.send((topic.to_string(), payload));
            })
            .unwrap();
        match broker.recv().await {
            Some(Packet::Subscribe(subscribe)) => {
                assert_eq!(subscribe.packet_id, 1);
                assert_eq!(subscribe.filters[0].0, "devices/1/command");
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
        broker
            .send(Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![0],
            }))
            .await;
        broker
            .send(Packet::Publish(Publish::at_most_once(
                "devices/1/command",
                Bytes::from_static(b"{\"name\":\"reboot\"}"),
            )))
            .await;

        let (topic, payload) = messages.recv().await.unwrap();
        assert_eq!(topic, "devices/1/command");
        assert_eq!(payload.as_ref(), b"{\"name\":\"reboot\"}");
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_refused_credentials_close_with_authentication_error() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let _connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(5).await;
        assert_eq!(broker.recv().await, None);

        match wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await {
            ConnectionEvent::Disconnected(Some(reason)) => {
                assert_eq!(reason.kind(), ErrorKind::Authentication);
                assert_eq!(
                    reason.to_string(),
                    "Authentication Error - Connection refused: not authorised"
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_drop_is_connection_lost() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let _connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(0).await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Authenticated).await;

        drop(broker);
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await,
            ConnectionEvent::Disconnected(Some(ConnectionError::ConnectionLost))
        );
    }

    #[tokio::test]
    async fn test_protocol_violation_closes_connection() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let _connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(0).await;
        broker.send(Packet::Pingreq).await;

        match wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await {
            ConnectionEvent::Disconnected(Some(reason)) => assert_eq!(
                reason.to_string(),
                "Wasn't expecting packet of type Pingreq when in state connected"
            ),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_pings_and_times_out() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let _connection = open(options(false), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(0).await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Authenticated).await;

        // answered ping keeps the connection alive
        assert_eq!(broker.recv().await, Some(Packet::Pingreq));
        broker.send(Packet::Pingresp).await;
        assert_eq!(broker.recv().await, Some(Packet::Pingreq));

        // unanswered ping: the next tick finds nothing received within the interval
        assert_eq!(broker.recv().await, None);
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await,
            ConnectionEvent::Disconnected(Some(ConnectionError::KeepAliveTimeout))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_keep_alive_never_pings() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut opts = options(false);
        opts.keep_alive = 0;
        let connection = open(opts, connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();
        let mut broker = Broker::new(brokers.recv().await.unwrap());
        broker.accept(0).await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Authenticated).await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        connection.close();
        assert_eq!(broker.recv().await, Some(Packet::Disconnect));
    }

    #[tokio::test]
    async fn test_secure_connection_authenticates() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let connection = open(options(true), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();

        let server = brokers.recv().await.unwrap();
        let tls = acceptor(&[SERVER_CERT], SERVER_KEY)
            .accept(server)
            .await
            .unwrap();
        let mut broker = Broker::new(tls);
        broker.accept(0).await;

        assert_eq!(
            wait_for(&mut events, |e| *e == ConnectionEvent::Authenticated).await,
            ConnectionEvent::Authenticated
        );
        assert!(connection.is_connected());
        assert_eq!(connector.attempts()[0].1, 8883);
    }

    #[tokio::test]
    async fn test_untrusted_broker_is_rejected_before_connect_packet() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let _connection = open(options(true), connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();

        let server = brokers.recv().await.unwrap();
        assert!(acceptor(&[ROGUE_SERVER_CERT], ROGUE_SERVER_KEY)
            .accept(server)
            .await
            .is_err());

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = matches!(event, ConnectionEvent::Disconnected(_));
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Connecting,
                ConnectionEvent::Disconnected(Some(ConnectionError::Certificate(
                    "Unable to verify the certificate for broker.test.local".into()
                ))),
            ]
        );
    }

    #[tokio::test]
    async fn test_hostname_mismatch_is_rejected_after_handshake() {
        let (connector, mut brokers) = MockConnector::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut opts = options(true);
        opts.host = "other.test.local".into();
        let _connection = open(opts, connector.as_ref(), &test_anchors(), tx)
            .await
            .unwrap();

        // the client may drop the pipe before the server finishes writing its
        // session tickets, so only the client side is authoritative here
        let server = brokers.recv().await.unwrap();
        if let Ok(mut tls) = acceptor(&[SERVER_CERT], SERVER_KEY).accept(server).await {
            let mut buf = Vec::new();
            let _ = tls.read_to_end(&mut buf).await;
            assert!(buf.is_empty(), "no protocol bytes may follow a hostname mismatch");
        }

        assert_eq!(
            wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await,
            ConnectionEvent::Disconnected(Some(ConnectionError::Certificate(
                "The hostname other.test.local does not match the server certificate".into()
            )))
        );
    }
}
