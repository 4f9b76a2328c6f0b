//! Value-level binary encoding shared by every protocol message shape.
//!
//! Encoding rules:
//! - fixed-width integers and floats are big-endian
//! - `String` is an `i32` byte length followed by the UTF-8 bytes
//! - sequences are an `i32` element count followed by the elements
//! - maps are an `i32` entry count followed by interleaved key/value pairs
//! - nested shapes encode their fields in declaration order with no tags
//!
//! There is no per-field type information on the wire; encoder and decoder
//! agree on the layout through the `(type id, type version)` pair carried in
//! the frame header. Shapes declare their ordered field list once through
//! [`wire_shape!`](crate::wire_shape), which derives both directions of the
//! walk from the same declaration, so adding a field updates the wire format
//! without touching the codec.

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

/// Errors produced while decoding a value from a byte buffer.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// The buffer ended before the value was complete.
    #[error("buffer underrun at offset {offset}: need {needed} bytes, {available} available")]
    Underrun {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A string field did not contain valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(String),

    /// A length or count prefix was negative.
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    /// A byte did not map to any variant of the expected enum.
    #[error("invalid value {value} for {what}")]
    InvalidEnum { what: &'static str, value: u8 },
}

/// Cursor over a byte slice that tracks the read position and fails loudly
/// on underrun instead of truncating.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes and returns the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Underrun {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        // take() already validated the length, so the conversion cannot fail.
        Ok(self.take(N)?.try_into().unwrap())
    }
}

/// A value that knows how to write itself to and read itself from the wire.
///
/// Implemented for the primitive field kinds, for `Vec<T>`/`HashMap<K, V>`
/// over them, and for every message shape declared with
/// [`wire_shape!`](crate::wire_shape). User payload types implement it the
/// same way the catalog shapes do.
pub trait WireValue: Sized {
    fn write(&self, buf: &mut Vec<u8>);
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError>;
}

/// A [`WireValue`] bound to a `(type id, type version)` pair in the catalog.
///
/// The pair is the dispatch key carried in the frame header; it must be
/// unique across all shapes.
pub trait WireShape: WireValue {
    const TYPE_ID: u8;
    const TYPE_VERSION: u8;
}

macro_rules! impl_wire_numeric {
    ($($ty:ty),* $(,)?) => {$(
        impl WireValue for $ty {
            fn write(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_be_bytes());
            }

            fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
                Ok(<$ty>::from_be_bytes(reader.take_array()?))
            }
        }
    )*};
}

impl_wire_numeric!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl WireValue for bool {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(if *self { 0x01 } else { 0x00 });
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(reader.take_array::<1>()?[0] != 0)
    }
}

impl WireValue for String {
    fn write(&self, buf: &mut Vec<u8>) {
        let bytes = self.as_bytes();
        (bytes.len() as i32).write(buf);
        buf.extend_from_slice(bytes);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let len = i32::read(reader)?;
        if len < 0 {
            return Err(DecodeError::NegativeLength(len));
        }
        let bytes = reader.take(len as usize)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

// Covers both homogeneous sequences and raw byte arrays: a `Vec<u8>` written
// element-wise produces exactly `i32 length + raw bytes`.
impl<T: WireValue> WireValue for Vec<T> {
    fn write(&self, buf: &mut Vec<u8>) {
        (self.len() as i32).write(buf);
        for item in self {
            item.write(buf);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let count = i32::read(reader)?;
        if count < 0 {
            return Err(DecodeError::NegativeLength(count));
        }
        // Cap the pre-allocation: a hostile count must not reserve memory the
        // buffer cannot possibly back.
        let count = count as usize;
        let mut items = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }
}

impl<K, V> WireValue for HashMap<K, V>
where
    K: WireValue + Eq + Hash,
    V: WireValue,
{
    fn write(&self, buf: &mut Vec<u8>) {
        (self.len() as i32).write(buf);
        for (key, value) in self {
            key.write(buf);
            value.write(buf);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let count = i32::read(reader)?;
        if count < 0 {
            return Err(DecodeError::NegativeLength(count));
        }
        let mut map = HashMap::new();
        for _ in 0..count {
            let key = K::read(reader)?;
            let value = V::read(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Declares a protocol message shape: the struct, its ordered field walk for
/// [`WireValue`], and its `(type id, type version)` binding for
/// [`WireShape`].
///
/// ```rust
/// use wirebus_core::wire_shape;
///
/// wire_shape! {
///     /// Example payload carried on the bus.
///     pub struct SensorReading = (40, 1) {
///         pub sensor: String,
///         pub celsius: f64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_shape {
    (
        $(#[$meta:meta])*
        pub struct $name:ident = ($id:expr, $version:expr) {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::protocol::wire::WireValue for $name {
            fn write(&self, buf: &mut Vec<u8>) {
                $( $crate::protocol::wire::WireValue::write(&self.$field, buf); )*
                // Suppress the unused-variable lint for field-less shapes.
                let _ = buf;
            }

            fn read(
                reader: &mut $crate::protocol::wire::ByteReader<'_>,
            ) -> Result<Self, $crate::protocol::wire::DecodeError> {
                let _ = &reader;
                Ok(Self {
                    $( $field: $crate::protocol::wire::WireValue::read(reader)?, )*
                })
            }
        }

        impl $crate::protocol::wire::WireShape for $name {
            const TYPE_ID: u8 = $id;
            const TYPE_VERSION: u8 = $version;
        }
    };
}

// ── Tests ─────────────────────────────────────────────────────────────────────
