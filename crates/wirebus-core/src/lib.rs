//! # wirebus-core
//!
//! Shared library for the WireBus event bus containing the wire protocol
//! codec, the message catalog, and the framed socket transport.
//!
//! This crate is used by both the broker and client crates. It defines:
//!
//! - **`protocol`** – how bytes travel over the network. Messages are
//!   encoded into a compact binary format (22-byte header + body) and
//!   decoded back into typed Rust structs on the other end. The
//!   [`wire_shape!`] macro binds each message shape to its
//!   `(type id, type version)` dispatch key and derives the field walk, so
//!   there is no runtime reflection anywhere in the codec.
//!
//! - **`transport`** – length-prefixed framing over any `AsyncRead`/
//!   `AsyncWrite` stream: a reader never sees a partial frame and a short
//!   read at connection close is an error, not a truncated message.

pub mod protocol;
pub mod transport;

pub use protocol::codec::{
    decode_body, decode_frame, decode_payload, encode_frame, encode_payload, ProtocolError,
};
pub use protocol::messages::BusMessage;
pub use protocol::taskid::TaskIdCounter;
pub use protocol::wire::{WireShape, WireValue};
pub use transport::{read_frame, read_message, send_message, write_frame, TransportError};
