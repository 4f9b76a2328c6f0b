//! Protocol module: message catalog, value encoding, and the frame codec.

pub mod codec;
pub mod messages;
pub mod taskid;
pub mod wire;

pub use codec::{
    decode_body, decode_frame, decode_payload, encode_frame, encode_frame_at, encode_payload,
    ProtocolError,
};
pub use messages::*;
pub use taskid::TaskIdCounter;
pub use wire::{ByteReader, DecodeError, WireShape, WireValue};
