//! MQTT 3.1/3.1.1 packet encoding and incremental decoding.
//!
//! Every packet is framed as:
//!
//! ```text
//! +--------------------+------------------------------+-----------------+
//! | type:4 | flags:4   | remaining length (1-4 bytes) | body            |
//! +--------------------+------------------------------+-----------------+
//! ```
//!
//! The remaining length is a variable-byte integer: 7 bits per byte, least
//! significant group first, high bit set on every byte but the last.
//!
//! [`encode`] turns a [`Packet`] into one contiguous frame. [`PacketCodec`]
//! accepts bytes in whatever chunks the socket delivers them, and returns every
//! packet completed by each delivery, keeping any partial trailing frame for the
//! next call.
//!
//! # Examples
//!
//! ```ignore
//! let mut codec = PacketCodec::new();
//! assert!(codec.feed(&[0x20])?.is_empty());
//! assert!(codec.feed(&[0x02, 0x00])?.is_empty());
//! let packets = codec.feed(&[0x00])?;
//! assert!(matches!(packets[0], Packet::Connack(_)));
//! assert!(codec.buffered().is_empty());
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Largest value a four-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Protocol revision announced in the Connect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`, level 3.
    #[serde(rename = "3.1")]
    V31,
    /// MQTT 3.1.1, protocol name `MQTT`, level 4.
    #[default]
    #[serde(rename = "3.1.1")]
    V311,
}

impl ProtocolVersion {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
        }
    }

    fn from_wire(name: String, level: u8) -> Result<Self, CodecError> {
        match (name.as_str(), level) {
            ("MQIsdp", 3) => Ok(ProtocolVersion::V31),
            ("MQTT", 4) => Ok(ProtocolVersion::V311),
            _ => Err(CodecError::UnsupportedProtocol { name, level }),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V31 => f.write_str("3.1"),
            ProtocolVersion::V311 => f.write_str("3.1.1"),
        }
    }
}

/// Delivery guarantee of a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQos(other)),
        }
    }
}

/// Connack return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    /// Codes 6-255 are reserved by the protocol.
    Reserved(u8),
}

impl ConnectReturnCode {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Reserved(other),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Reserved(other) => other,
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    /// Human-readable description, used in authentication error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => f.write_str("Connection Accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                f.write_str("Connection refused: unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => {
                f.write_str("Connection refused: client identifier rejected")
            }
            ConnectReturnCode::ServerUnavailable => {
                f.write_str("Connection refused: server unavailable")
            }
            ConnectReturnCode::BadUsernameOrPassword => {
                f.write_str("Connection refused: bad user name or password")
            }
            ConnectReturnCode::NotAuthorized => f.write_str("Connection refused: not authorised"),
            ConnectReturnCode::Reserved(code) => {
                write!(f, "Connection refused: error code {code}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present on the wire only when `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Fire-and-forget publish, the only kind this client sends.
    pub fn at_most_once(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// One control packet. Acknowledgement-only packets carry just their identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(u16),
    Pubrec(u16),
    Pubrel(u16),
    Pubcomp(u16),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(u16),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Packet type name, as used in protocol violation messages.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "Connect",
            Packet::Connack(_) => "Connack",
            Packet::Publish(_) => "Publish",
            Packet::Puback(_) => "Puback",
            Packet::Pubrec(_) => "Pubrec",
            Packet::Pubrel(_) => "Pubrel",
            Packet::Pubcomp(_) => "Pubcomp",
            Packet::Subscribe(_) => "Subscribe",
            Packet::Suback(_) => "Suback",
            Packet::Unsubscribe(_) => "Unsubscribe",
            Packet::Unsuback(_) => "Unsuback",
            Packet::Pingreq => "Pingreq",
            Packet::Pingresp => "Pingresp",
            Packet::Disconnect => "Disconnect",
        }
    }
}

/// Encodes a packet into a single frame with a minimal remaining-length field.
///
/// # Errors
/// - `StringTooLong` if a topic, client id or credential exceeds 65535 bytes
/// - `MissingPacketId` for a QoS 1/2 publish without an identifier
/// - `Malformed` for a subscribe/unsubscribe with no topic filters
/// - `PacketTooLarge` if the body exceeds [`MAX_REMAINING_LENGTH`]
pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    let header = match packet {
        Packet::Connect(connect) => {
            write_connect(&mut body, connect)?;
            CONNECT << 4
        }
        Packet::Connack(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code.into());
            CONNACK << 4
        }
        Packet::Publish(publish) => {
            write_string(&mut body, &publish.topic)?;
            if publish.qos != QoS::AtMostOnce {
                body.put_u16(publish.packet_id.ok_or(CodecError::MissingPacketId)?);
            }
            body.put_slice(&publish.payload);
            (PUBLISH << 4)
                | (u8::from(publish.dup) << 3)
                | ((publish.qos as u8) << 1)
                | u8::from(publish.retain)
        }
        Packet::Puback(id) => {
            body.put_u16(*id);
            PUBACK << 4
        }
        Packet::Pubrec(id) => {
            body.put_u16(*id);
            PUBREC << 4
        }
        Packet::Pubrel(id) => {
            body.put_u16(*id);
            (PUBREL << 4) | 0b0010
        }
        Packet::Pubcomp(id) => {
            body.put_u16(*id);
            PUBCOMP << 4
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(CodecError::Malformed("Subscribe"));
            }
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                write_string(&mut body, filter)?;
                body.put_u8(*qos as u8);
            }
            (SUBSCRIBE << 4) | 0b0010
        }
        Packet::Suback(suback) => {
            body.put_u16(suback.packet_id);
            body.put_slice(&suback.return_codes);
            SUBACK << 4
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(CodecError::Malformed("Unsubscribe"));
            }
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                write_string(&mut body, filter)?;
            }
            (UNSUBSCRIBE << 4) | 0b0010
        }
        Packet::Unsuback(id) => {
            body.put_u16(*id);
            UNSUBACK << 4
        }
        Packet::Pingreq => PINGREQ << 4,
        Packet::Pingresp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge(body.len()));
    }

    let mut frame = BytesMut::with_capacity(body.len() + 5);
    frame.put_u8(header);
    write_remaining_length(&mut frame, body.len());
    frame.put_slice(&body);
    Ok(frame.freeze())
}

fn write_connect(body: &mut BytesMut, connect: &Connect) -> Result<(), CodecError> {
    write_string(body, connect.protocol.protocol_name())?;
    body.put_u8(connect.protocol.level());

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= FLAG_CLEAN_SESSION;
    }
    if connect.username.is_some() {
        flags |= FLAG_USERNAME;
    }
    if connect.password.is_some() {
        flags |= FLAG_PASSWORD;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(body, &connect.client_id)?;
    if let Some(username) = &connect.username {
        write_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        write_string(body, password)?;
    }
    Ok(())
}

/// Appends `len` as a variable-byte integer using the fewest bytes possible.
fn write_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn write_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    let len = value.len();
    if len > u16::MAX as usize {
        return Err(CodecError::StringTooLong(len));
    }
    buf.put_u16(len as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Incremental decoder holding bytes between socket reads.
#[derive(Debug, Default)]
pub struct PacketCodec {
    buffer: BytesMut,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and decodes every packet it completes, in arrival order.
    ///
    /// A partial trailing frame stays buffered verbatim until later deliveries
    /// complete it.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, CodecError> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Bytes received but not yet forming a complete packet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        let Some((header_len, body_len)) = frame_length(&self.buffer)? else {
            return Ok(None);
        };
        if self.buffer.len() < header_len + body_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(header_len + body_len).freeze();
        let header = frame[0];
        frame.advance(header_len);
        decode_frame(header, frame).map(Some)
    }
}

/// Returns `(header length, body length)` once the whole fixed header is buffered.
fn frame_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let Some(&byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((2 + i, value)));
        }
        multiplier *= 128;
    }
    Err(CodecError::MalformedRemainingLength)
}

fn decode_frame(header: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let packet_type = header >> 4;
    let flags = header & 0x0F;
    let expect_flags = |expected: u8| {
        if flags == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidFlags { packet_type, flags })
        }
    };

    let packet = match packet_type {
        CONNECT => {
            expect_flags(0)?;
            Packet::Connect(read_connect(&mut body)?)
        }
        CONNACK => {
            expect_flags(0)?;
            let ack = read_u8(&mut body, "Connack")?;
            let code = read_u8(&mut body, "Connack")?;
            Packet::Connack(Connack {
                session_present: ack & 0x01 != 0,
                code: code.into(),
            })
        }
        PUBLISH => {
            let qos = QoS::try_from((flags >> 1) & 0x03)?;
            let topic = read_string(&mut body, "Publish")?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => Some(read_u16(&mut body, "Publish")?),
            };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: body.split_off(0),
            })
        }
        PUBACK => {
            expect_flags(0)?;
            Packet::Puback(read_u16(&mut body, "Puback")?)
        }
        PUBREC => {
            expect_flags(0)?;
            Packet::Pubrec(read_u16(&mut body, "Pubrec")?)
        }
        PUBREL => {
            expect_flags(0b0010)?;
            Packet::Pubrel(read_u16(&mut body, "Pubrel")?)
        }
        PUBCOMP => {
            expect_flags(0)?;
            Packet::Pubcomp(read_u16(&mut body, "Pubcomp")?)
        }
        SUBSCRIBE => {
            expect_flags(0b0010)?;
            let packet_id = read_u16(&mut body, "Subscribe")?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body, "Subscribe")?;
                let qos = QoS::try_from(read_u8(&mut body, "Subscribe")?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(CodecError::Malformed("Subscribe"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        SUBACK => {
            expect_flags(0)?;
            let packet_id = read_u16(&mut body, "Suback")?;
            Packet::Suback(Suback {
                packet_id,
                return_codes: body.split_off(0).to_vec(),
            })
        }
        UNSUBSCRIBE => {
            expect_flags(0b0010)?;
            let packet_id = read_u16(&mut body, "Unsubscribe")?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body, "Unsubscribe")?);
            }
            if filters.is_empty() {
                return Err(CodecError::Malformed("Unsubscribe"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        UNSUBACK => {
            expect_flags(0)?;
            Packet::Unsuback(read_u16(&mut body, "Unsuback")?)
        }
        PINGREQ => {
            expect_flags(0)?;
            Packet::Pingreq
        }
        PINGRESP => {
            expect_flags(0)?;
            Packet::Pingresp
        }
        DISCONNECT => {
            expect_flags(0)?;
            Packet::Disconnect
        }
        other => return Err(CodecError::UnknownPacketType(other)),
    };

    if body.has_remaining() {
        return Err(CodecError::Malformed(packet.name()));
    }
    Ok(packet)
}

fn read_connect(body: &mut Bytes) -> Result<Connect, CodecError> {
    let name = read_string(body, "Connect")?;
    let level = read_u8(body, "Connect")?;
    let protocol = ProtocolVersion::from_wire(name, level)?;
    let flags = read_u8(body, "Connect")?;
    let keep_alive = read_u16(body, "Connect")?;
    let client_id = read_string(body, "Connect")?;

    if flags & FLAG_WILL != 0 {
        // Will topic and message are accepted but not surfaced.
        read_string(body, "Connect")?;
        read_binary(body, "Connect")?;
    } else if flags & (FLAG_WILL_RETAIN | 0x18) != 0 {
        return Err(CodecError::Malformed("Connect"));
    }

    let username = if flags & FLAG_USERNAME != 0 {
        Some(read_string(body, "Connect")?)
    } else {
        None
    };
    let password = if flags & FLAG_PASSWORD != 0 {
        Some(read_string(body, "Connect")?)
    } else {
        None
    };

    Ok(Connect {
        protocol,
        client_id,
        keep_alive,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
        username,
        password,
    })
}

fn read_u8(buf: &mut Bytes, packet: &'static str) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Malformed(packet));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes, packet: &'static str) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Malformed(packet));
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes, packet: &'static str) -> Result<Bytes, CodecError> {
    let len = read_u16(buf, packet)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Malformed(packet));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, packet: &'static str) -> Result<String, CodecError> {
    let raw = read_binary(buf, packet)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}
