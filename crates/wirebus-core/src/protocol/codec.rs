//! Frame-level encoding and decoding for the WireBus protocol.
//!
//! [`encode_frame`] wraps a shape's body bytes with the 22-byte header
//! described in [`crate::protocol::messages`]; [`decode_frame`] parses the
//! header and dispatches body decoding on the `(type_id, type_version)`
//! pair. Payloads carried inside publish/query/delivery messages are plain
//! shape bodies with no header; [`encode_payload`] and [`decode_payload`]
//! handle those.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::protocol::messages::{
    AckMessage, BusMessage, DeliveryMessage, FrameHeader, HandshakeProbe, Heartbeat, MessageKind,
    PublishMessage, QueryMessage, SubscribeMessage, UnsubscribeMessage, FRAME_HEADER_LEN,
    WIRE_VERSION,
};
use crate::protocol::wire::{ByteReader, DecodeError, WireShape, WireValue};

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The type id byte in the header is not in the catalog.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The shape version in the header is not supported for this type.
    #[error("unsupported version {version} for message type 0x{type_id:02X}")]
    UnsupportedVersion { type_id: u8, version: u8 },

    /// The declared frame length cannot even hold the header.
    #[error("declared frame length {0} is shorter than the {FRAME_HEADER_LEN}-byte header")]
    FrameTooShort(u32),

    /// The declared frame length exceeds the sanity cap.
    #[error("declared frame length {declared} exceeds the {max}-byte cap")]
    FrameTooLarge { declared: u32, max: u32 },

    /// The buffer holds fewer bytes than the header declares.
    #[error("frame length mismatch: header declares {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    /// The body could not be decoded as the declared shape.
    #[error("malformed {kind:?} body: {source}")]
    MalformedBody {
        kind: MessageKind,
        #[source]
        source: DecodeError,
    },
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes `shape` into a complete frame, stamping both header clocks from
/// the system time.
pub fn encode_frame<S: WireShape>(shape: &S) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    encode_frame_at(shape, now.as_micros() as i64, now.as_millis() as i64)
}

/// Encodes `shape` into a complete frame with caller-supplied header clocks.
pub fn encode_frame_at<S: WireShape>(
    shape: &S,
    origin_timestamp: i64,
    sent_at_millis: i64,
) -> Vec<u8> {
    let mut body = Vec::new();
    shape.write(&mut body);

    let frame_len = (FRAME_HEADER_LEN + body.len()) as u32;
    let mut frame = Vec::with_capacity(frame_len as usize);
    frame.extend_from_slice(&frame_len.to_be_bytes());
    frame.extend_from_slice(&origin_timestamp.to_be_bytes());
    frame.push(S::TYPE_ID);
    frame.push(S::TYPE_VERSION);
    frame.extend_from_slice(&sent_at_millis.to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Encodes an application message into the opaque payload bytes carried by
/// publish/query/delivery frames.
pub fn encode_payload<T: WireValue>(message: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    message.write(&mut buf);
    buf
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes one complete frame from the beginning of `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the header is malformed, the buffer is
/// shorter than the declared frame length, or the body does not decode as
/// the declared shape.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, BusMessage), ProtocolError> {
    let header = FrameHeader::parse(bytes)?;
    let total = header.frame_len as usize;
    if bytes.len() < total {
        return Err(ProtocolError::LengthMismatch {
            declared: total,
            available: bytes.len(),
        });
    }

    let body = &bytes[FRAME_HEADER_LEN..total];
    let message = decode_body(&header, body)?;
    Ok((header, message))
}

/// Decodes a frame body against the shape named by `header`.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownMessageType`] or
/// [`ProtocolError::UnsupportedVersion`] when the dispatch key is not in the
/// catalog, and [`ProtocolError::MalformedBody`] when the body bytes do not
/// match the shape's field layout.
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<BusMessage, ProtocolError> {
    let kind = MessageKind::try_from(header.type_id)
        .map_err(|_| ProtocolError::UnknownMessageType(header.type_id))?;
    if header.type_version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            type_id: header.type_id,
            version: header.type_version,
        });
    }

    let mut reader = ByteReader::new(body);
    let wrap = |source| ProtocolError::MalformedBody { kind, source };
    let message = match kind {
        MessageKind::HandshakeProbe => {
            BusMessage::HandshakeProbe(HandshakeProbe::read(&mut reader).map_err(wrap)?)
        }
        MessageKind::Subscribe => {
            BusMessage::Subscribe(SubscribeMessage::read(&mut reader).map_err(wrap)?)
        }
        MessageKind::Unsubscribe => {
            BusMessage::Unsubscribe(UnsubscribeMessage::read(&mut reader).map_err(wrap)?)
        }
        MessageKind::Publish => {
            BusMessage::Publish(PublishMessage::read(&mut reader).map_err(wrap)?)
        }
        MessageKind::Delivery => {
            BusMessage::Delivery(DeliveryMessage::read(&mut reader).map_err(wrap)?)
        }
        MessageKind::Query => BusMessage::Query(QueryMessage::read(&mut reader).map_err(wrap)?),
        MessageKind::Ack => BusMessage::Ack(AckMessage::read(&mut reader).map_err(wrap)?),
        MessageKind::Heartbeat => {
            BusMessage::Heartbeat(Heartbeat::read(&mut reader).map_err(wrap)?)
        }
    };
    Ok(message)
}

/// Decodes payload bytes produced by [`encode_payload`] back into a typed
/// application message.
///
/// # Errors
///
/// Returns [`DecodeError`] when the bytes do not match `T`'s field layout.
pub fn decode_payload<T: WireValue>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut reader = ByteReader::new(bytes);
    T::read(&mut reader)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
