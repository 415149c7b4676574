//! Device session: identity, reconnect policy and offline backlog.
//!
//! A [`Device`] is a thin handle. All mutable session state (the live
//! connection, the backlog, the pending retry deadline and whether the device
//! ever connected) is owned by one kernel task, so operations on a device are
//! applied strictly in call order and never race with connection events.
//!
//! # Reconnect policy
//!
//! When a connection ends with a reason, a `Close(reason)` event is emitted first.
//! Then:
//! - if the device connected before, retries are enabled and the reason is not an
//!   authentication failure, one reconnect is scheduled after `retry_delay`
//! - otherwise the reason is fatal and is reported as `Fault(reason)`
//!
//! A device that never connected therefore never retries silently.
//!
//! # Backlog
//!
//! State sent while disconnected is queued. On the next successful
//! authentication the whole queue is published as one JSON array before the
//! `Connect`/`Reconnect` event and before the command subscription.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, trace, warn};
use validator::Validate;

use crate::{
    backlog::{Backlog, StateRecord, Timestamp},
    config::DeviceConfig,
    connection::{self, Connection},
    error::{ConnectionError, DeviceError},
    ext_json,
    session::{ConnectionEvent, ConnectionOptions},
    transport::{Connector, TcpConnector},
    verifier::TrustAnchors,
};

/// Credentials of one device. All three values must be non-empty.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeviceIdentity {
    #[validate(length(min = 1, message = "Invalid Device Id"))]
    pub device_id: String,
    #[validate(length(min = 1, message = "Invalid Key"))]
    pub key: String,
    #[validate(length(min = 1, message = "Invalid Secret"))]
    pub secret: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let identity = Self {
            device_id: device_id.into(),
            key: key.into(),
            secret: secret.into(),
        };
        identity.check()?;
        Ok(identity)
    }

    /// Reports the first invalid field, in the order device id, key, secret.
    pub fn check(&self) -> Result<(), DeviceError> {
        let Err(errors) = self.validate() else {
            return Ok(());
        };
        let fields = errors.field_errors();
        for field in ["device_id", "key", "secret"] {
            let message = fields
                .get(field)
                .and_then(|errs| errs.first())
                .and_then(|err| err.message.as_ref());
            if let Some(message) = message {
                return Err(DeviceError::Validation(message.to_string()));
            }
        }
        Err(DeviceError::Validation(errors.to_string()))
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Notifications raised by a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// First successful authentication.
    Connect,
    /// Authenticated again after a lost connection.
    Reconnect,
    /// The connection ended. `None` for an orderly close.
    Close(Option<ConnectionError>),
    /// A command received on the command topic, extended JSON normalized.
    Command(Value),
    /// A failure the reconnect policy will not absorb.
    Fault(ConnectionError),
}

pub type DeviceEvents = mpsc::UnboundedReceiver<DeviceEvent>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DeviceStatus {
    connected: bool,
    backlog: usize,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Close,
    SendState(StateRecord),
}

/// Handle to a device session.
///
/// Must be created inside a tokio runtime. Dropping the handle closes the
/// session.
pub struct Device {
    device_id: String,
    state_topic: String,
    command_topic: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<DeviceStatus>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Device {
    /// Builds a device that connects over TCP.
    ///
    /// # Errors
    /// - `Validation` for an empty device id, key or secret
    /// - `Config` when `config` fails validation
    /// - `TrustStore` when the configured CA bundle cannot be loaded
    pub fn new(
        identity: DeviceIdentity,
        config: DeviceConfig,
    ) -> Result<(Self, DeviceEvents), DeviceError> {
        identity.check()?;
        config.check()?;
        let anchors = config.trust_anchors()?;
        Self::with_connector(identity, config, Arc::new(TcpConnector), anchors)
    }

    /// Builds a device on a custom transport and trust anchors.
    pub fn with_connector(
        identity: DeviceIdentity,
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        anchors: TrustAnchors,
    ) -> Result<(Self, DeviceEvents), DeviceError> {
        identity.check()?;
        config.check()?;

        let state_topic = config.state_topic_for(&identity.device_id);
        let command_topic = config.command_topic_for(&identity.device_id);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DeviceStatus::default());

        let device = Device {
            device_id: identity.device_id.clone(),
            state_topic: state_topic.clone(),
            command_topic: command_topic.clone(),
            commands: commands_tx,
            status: status_rx,
        };

        let kernel = Kernel {
            identity,
            config,
            connector,
            anchors,
            state_topic,
            command_topic,
            commands: commands_rx,
            events: events_tx,
            status: status_tx,
            connection: None,
            connection_events: None,
            backlog: Backlog::default(),
            retry_at: None,
            was_connected: false,
            authenticated: false,
        };
        tokio::spawn(kernel.run());

        Ok((device, events_rx))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// True while authenticated with the broker.
    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    /// Number of state reports waiting for a connection.
    pub fn backlog_len(&self) -> usize {
        self.status.borrow().backlog
    }

    /// Opens a connection unless one exists or a reconnect is pending.
    ///
    /// Returns once the transport is connected; authentication completes
    /// asynchronously and is reported as `Connect`/`Reconnect`.
    ///
    /// # Errors
    /// `Connection` if the transport could not be opened and the reconnect
    /// policy does not apply (a `Close` event is emitted first).
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(tx))?;
        rx.await.map_err(|_| DeviceError::KernelStopped)??;
        Ok(())
    }

    /// Closes the connection and cancels any pending reconnect.
    pub fn close(&self) -> Result<(), DeviceError> {
        self.send(Command::Close)
    }

    /// Reports `state` stamped with the current time. Never waits for the network.
    pub fn send_state<S: Serialize>(&self, state: &S) -> Result<(), DeviceError> {
        self.send_state_at(state, Timestamp::now())
    }

    /// Reports `state` at `time`. Numeric times below 10^12 are seconds.
    pub fn send_state_at<S: Serialize>(
        &self,
        state: &S,
        time: impl Into<Timestamp>,
    ) -> Result<(), DeviceError> {
        let record = StateRecord::new(serde_json::to_value(state)?, time);
        self.send(Command::SendState(record))
    }

    fn send(&self, command: Command) -> Result<(), DeviceError> {
        self.commands
            .send(command)
            .map_err(|_| DeviceError::KernelStopped)
    }
}

struct Kernel {
    identity: DeviceIdentity,
    config: DeviceConfig,
    connector: Arc<dyn Connector>,
    anchors: TrustAnchors,
    state_topic: String,
    command_topic: String,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    status: watch::Sender<DeviceStatus>,
    connection: Option<Connection>,
    connection_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    backlog: Backlog,
    retry_at: Option<Instant>,
    was_connected: bool,
    authenticated: bool,
}

impl Kernel {
    async fn run(mut self) {
        debug!("Device {} kernel started", self.identity.device_id);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.connection_events) => self.handle_event(event),
                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    info!("Reconnecting device {}", self.identity.device_id);
                    if let Err(err) = self.connect().await {
                        self.fault(err);
                    }
                }
            }
        }

        self.close();
        debug!("Device {} kernel stopped", self.identity.device_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Close => self.close(),
            Command::SendState(record) => self.send_state(record).await,
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Authenticated => self.on_authenticated(),
            ConnectionEvent::Disconnected(reason) => self.on_disconnected(reason),
            other => trace!("Connection event: {other:?}"),
        }
    }

    fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.config.resolve_host(),
            port: self.config.resolve_port(),
            secure: self.config.secure,
            client_id: self.identity.device_id.clone(),
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            username: Some(self.identity.key.clone()),
            password: Some(self.identity.secret.clone()),
            protocol_version: self.config.protocol_version,
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.retry_at.is_some() || self.connection.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match connection::open(self.options(), self.connector.as_ref(), &self.anchors, tx).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.connection_events = Some(rx);
                Ok(())
            }
            Err(err) => {
                self.emit(DeviceEvent::Close(Some(err.clone())));
                if self.was_connected && self.config.retry_lost_connection {
                    warn!("Reconnect attempt failed: {err}");
                    self.schedule_retry();
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
        if self.retry_at.take().is_some() {
            debug!("Pending reconnect cancelled");
        }
    }

    async fn send_state(&mut self, record: StateRecord) {
        if self.connection.is_none() && self.retry_at.is_none() && self.config.connect_on_send {
            if let Err(err) = self.connect().await {
                self.fault(err);
            }
        }

        if self.authenticated {
            if let Some(connection) = &self.connection {
                let published = record
                    .to_payload()
                    .map_err(|e| e.to_string())
                    .and_then(|payload| {
                        connection
                            .publish(self.state_topic.as_str(), payload)
                            .map_err(|e| e.to_string())
                    });
                match published {
                    Ok(()) => return,
                    Err(err) => debug!("Publishing state failed, queueing it: {err}"),
                }
            }
        }

        self.backlog.push(record);
        self.publish_status();
    }

    fn on_authenticated(&mut self) {
        let Some(connection) = &self.connection else {
            return;
        };

        if !self.backlog.is_empty() {
            let flushed = self
                .backlog
                .to_payload()
                .map_err(|e| e.to_string())
                .and_then(|payload| {
                    connection
                        .publish(self.state_topic.as_str(), payload)
                        .map_err(|e| e.to_string())
                });
            match flushed {
                Ok(()) => {
                    info!("Flushed {} queued state reports", self.backlog.len());
                    self.backlog.clear();
                }
                Err(err) => warn!("Could not flush state backlog: {err}"),
            }
        }

        let events = self.events.clone();
        let subscribed = connection.subscribe(
            self.command_topic.as_str(),
            move |topic: &str, payload: bytes::Bytes| match parse_command(&payload) {
                Some(command) => {
                    let _ = events.send(DeviceEvent::Command(command));
                }
                None => debug!("Dropping empty or malformed command on {topic}"),
            },
        );

        self.authenticated = true;
        self.publish_status();
        if self.was_connected {
            self.emit(DeviceEvent::Reconnect);
        } else {
            self.was_connected = true;
            self.emit(DeviceEvent::Connect);
        }

        if let Err(err) = subscribed {
            warn!("Could not subscribe to {}: {err}", self.command_topic);
        }
    }

    fn on_disconnected(&mut self, reason: Option<ConnectionError>) {
        self.connection = None;
        self.connection_events = None;
        self.authenticated = false;
        self.publish_status();
        self.emit(DeviceEvent::Close(reason.clone()));

        let Some(reason) = reason else {
            info!("Device {} disconnected", self.identity.device_id);
            return;
        };
        if self.was_connected && self.config.retry_lost_connection && reason.is_retryable() {
            warn!(
                "Connection lost ({reason}), retrying in {}s",
                self.config.retry_delay
            );
            self.schedule_retry();
        } else {
            self.fault(reason);
        }
    }

    fn schedule_retry(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let delay = self.config.retry_delay();
        self.retry_at.get_or_insert_with(|| Instant::now() + delay);
    }

    fn fault(&self, err: ConnectionError) {
        error!("Device {} failed: {err}", self.identity.device_id);
        self.emit(DeviceEvent::Fault(err));
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for device events");
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(DeviceStatus {
            connected: self.authenticated,
            backlog: self.backlog.len(),
        });
    }
}

/// Parses and normalizes a command payload.
///
/// `None` for anything that is not valid JSON, and for a command that
/// normalizes to `null`.
fn parse_command(payload: &[u8]) -> Option<Value> {
    let value = serde_json::from_slice::<Value>(payload).ok()?;
    Some(ext_json::normalize(value)).filter(|command| !command.is_null())
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
) -> ConnectionEvent {
    match events {
        // a driver that vanished without its final event lost the connection
        Some(rx) => rx
            .recv()
            .await
            .unwrap_or(ConnectionEvent::Disconnected(Some(ConnectionError::ConnectionLost))),
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
