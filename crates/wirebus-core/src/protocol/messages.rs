//! The fixed catalog of WireBus protocol messages.
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! [frame_len:4][origin_timestamp:8][type_id:1][type_version:1][sent_at_millis:8][body:N]
//! ```
//!
//! Total header size: 22 bytes. All multi-byte integers are big-endian.
//! `frame_len` counts the whole frame, header included. The
//! `(type_id, type_version)` pair selects the body shape; bodies carry no
//! per-field tags.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;
use crate::protocol::wire::{ByteReader, DecodeError, WireValue};
use crate::wire_shape;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 22;

/// Catalog-wide shape version carried in every frame header.
pub const WIRE_VERSION: u8 = 0x01;

/// Upper bound on a declared frame length. Anything larger is treated as a
/// corrupt or hostile header rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes in the catalog.
///
/// The values are protocol constants shared by client and broker; changing
/// one is a wire-compatibility break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    HandshakeProbe = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Publish = 0x04,
    Delivery = 0x05,
    Query = 0x06,
    Ack = 0xFE,
    Heartbeat = 0xFF,
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageKind::HandshakeProbe),
            0x02 => Ok(MessageKind::Subscribe),
            0x03 => Ok(MessageKind::Unsubscribe),
            0x04 => Ok(MessageKind::Publish),
            0x05 => Ok(MessageKind::Delivery),
            0x06 => Ok(MessageKind::Query),
            0xFE => Ok(MessageKind::Ack),
            0xFF => Ok(MessageKind::Heartbeat),
            _ => Err(()),
        }
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// The 22-byte header prepended to every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length in bytes, this field included.
    pub frame_len: u32,
    /// Sender clock at frame construction, microseconds since Unix epoch.
    /// Informational only; never interpreted by the receiver.
    pub origin_timestamp: i64,
    /// Raw type id byte; dispatched through [`MessageKind`].
    pub type_id: u8,
    /// Shape version for `type_id`.
    pub type_version: u8,
    /// Sender clock at send time, milliseconds since Unix epoch.
    pub sent_at_millis: i64,
}

impl FrameHeader {
    /// Parses the fixed-size header prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if fewer than [`FRAME_HEADER_LEN`] bytes are
    /// available or the declared frame length is impossible.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::InsufficientData {
                needed: FRAME_HEADER_LEN,
                available: bytes.len(),
            });
        }

        let frame_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if (frame_len as usize) < FRAME_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(frame_len));
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                declared: frame_len,
                max: MAX_FRAME_LEN,
            });
        }

        Ok(Self {
            frame_len,
            origin_timestamp: i64::from_be_bytes(bytes[4..12].try_into().unwrap()),
            type_id: bytes[12],
            type_version: bytes[13],
            sent_at_millis: i64::from_be_bytes(bytes[14..22].try_into().unwrap()),
        })
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> usize {
        self.frame_len as usize - FRAME_HEADER_LEN
    }
}

// ── Ack status ────────────────────────────────────────────────────────────────

/// Outcome byte carried by [`AckMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckStatus {
    Wait = 0x00,
    Success = 0x01,
    Fail = 0x02,
}

impl Default for AckStatus {
    fn default() -> Self {
        AckStatus::Wait
    }
}

impl WireValue for AckStatus {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let byte = reader.take(1)?[0];
        match byte {
            0x00 => Ok(AckStatus::Wait),
            0x01 => Ok(AckStatus::Success),
            0x02 => Ok(AckStatus::Fail),
            other => Err(DecodeError::InvalidEnum {
                what: "AckStatus",
                value: other,
            }),
        }
    }
}

// ── Catalog shapes ────────────────────────────────────────────────────────────

wire_shape! {
    /// First frame a client sends after the TCP connect: proves the remote
    /// peer is a WireBus broker before the connection is marked usable.
    /// Answered with an [`AckMessage`] echoing `task_id`.
    pub struct HandshakeProbe = (0x01, 1) {
        pub task_id: u32,
    }
}

wire_shape! {
    /// Registers the sending connection for fan-out on `subject`.
    pub struct SubscribeMessage = (0x02, 1) {
        pub task_id: u32,
        pub subject: String,
    }
}

wire_shape! {
    /// Removes the sending connection from `subject`'s subscriber set.
    pub struct UnsubscribeMessage = (0x03, 1) {
        pub task_id: u32,
        pub subject: String,
    }
}

wire_shape! {
    /// Carries an encoded application message to be fanned out on `subject`.
    /// Also doubles as the reply path for an in-flight query on `subject`.
    pub struct PublishMessage = (0x04, 1) {
        pub task_id: u32,
        pub subject: String,
        pub payload: Vec<u8>,
    }
}

wire_shape! {
    /// Broker-to-client event delivery: ordinary fan-out, a forwarded query,
    /// or the answer to one. The receiver tells the cases apart by matching
    /// `task_id` against its own pending queries.
    pub struct DeliveryMessage = (0x05, 1) {
        pub task_id: u32,
        pub subject: String,
        pub payload: Vec<u8>,
    }
}

wire_shape! {
    /// Request/response on top of pub/sub: forwarded to `subject`'s
    /// subscribers; whichever subscriber publishes back on `subject` answers.
    pub struct QueryMessage = (0x06, 1) {
        pub task_id: u32,
        pub subject: String,
        pub payload: Vec<u8>,
    }
}

wire_shape! {
    /// Generic broker response correlated by `task_id`.
    pub struct AckMessage = (0xFE, 1) {
        pub task_id: u32,
        pub status: AckStatus,
        pub message: String,
    }
}

wire_shape! {
    /// Liveness probe. Echoed back unchanged by the broker.
    pub struct Heartbeat = (0xFF, 1) {
    }
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every decoded WireBus message, discriminated by catalog type.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    HandshakeProbe(HandshakeProbe),
    Subscribe(SubscribeMessage),
    Unsubscribe(UnsubscribeMessage),
    Publish(PublishMessage),
    Delivery(DeliveryMessage),
    Query(QueryMessage),
    Ack(AckMessage),
    Heartbeat(Heartbeat),
}

impl BusMessage {
    /// Returns the [`MessageKind`] discriminant for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::HandshakeProbe(_) => MessageKind::HandshakeProbe,
            BusMessage::Subscribe(_) => MessageKind::Subscribe,
            BusMessage::Unsubscribe(_) => MessageKind::Unsubscribe,
            BusMessage::Publish(_) => MessageKind::Publish,
            BusMessage::Delivery(_) => MessageKind::Delivery,
            BusMessage::Query(_) => MessageKind::Query,
            BusMessage::Ack(_) => MessageKind::Ack,
            BusMessage::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
