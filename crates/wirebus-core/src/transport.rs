//! Framed socket I/O: turns a byte stream into discrete frames and back.
//!
//! [`read_frame`] blocks until one complete frame is available, looping on
//! partial reads. A connection that closes cleanly between frames yields
//! `Ok(None)`; one that closes mid-frame yields
//! [`TransportError::Truncated`] — a short read is never silently treated as
//! a smaller frame.
//!
//! Frame writes must be serialized per connection by the caller (one writer
//! lock per socket); [`write_frame`] itself issues a single `write_all` so
//! two frames written under the lock can never interleave.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::codec::{decode_body, encode_frame, ProtocolError};
use crate::protocol::messages::{BusMessage, FrameHeader, FRAME_HEADER_LEN};
use crate::protocol::wire::WireShape;

/// Errors surfaced by the framed transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame after {got} of {expected} bytes")]
    Truncated { got: usize, expected: usize },

    /// An I/O error occurred on the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame header was malformed; framing is lost beyond recovery.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads exactly `buf.len()` bytes, or reports how far it got.
///
/// Returns `Ok(false)` when the stream ends before the first byte — the
/// clean-EOF case the caller turns into `None`.
async fn read_exact_or_eof<R>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, (usize, std::io::Error)>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err((
                    filled,
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream closed"),
                ))
            }
            Ok(n) => filled += n,
            Err(e) => return Err((filled, e)),
        }
    }
    Ok(true)
}

/// Reads one complete frame from `reader`.
///
/// Returns `Ok(None)` on clean end-of-stream at a frame boundary.
///
/// # Errors
///
/// [`TransportError::Truncated`] when the stream ends mid-frame,
/// [`TransportError::Io`] for socket failures, and
/// [`TransportError::Protocol`] when the header itself is malformed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    match read_exact_or_eof(reader, &mut header_buf).await {
        Ok(false) => return Ok(None),
        Ok(true) => {}
        Err((got, e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Truncated {
                got,
                expected: FRAME_HEADER_LEN,
            })
        }
        Err((_, e)) => return Err(TransportError::Io(e)),
    }

    let header = FrameHeader::parse(&header_buf)?;
    let mut body = vec![0u8; header.body_len()];
    match read_exact_or_eof(reader, &mut body).await {
        Ok(true) => Ok(Some((header, body))),
        Ok(false) => Err(TransportError::Truncated {
            got: FRAME_HEADER_LEN,
            expected: header.frame_len as usize,
        }),
        Err((got, e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Truncated {
                got: FRAME_HEADER_LEN + got,
                expected: header.frame_len as usize,
            })
        }
        Err((_, e)) => Err(TransportError::Io(e)),
    }
}

/// Reads one frame and decodes its body into a [`BusMessage`].
///
/// Convenience for peers that treat any undecodable frame as fatal; dispatch
/// loops that drop bad frames and continue should call [`read_frame`] and
/// [`decode_body`] separately.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<BusMessage>, TransportError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        None => Ok(None),
        Some((header, body)) => Ok(Some(decode_body(&header, &body)?)),
    }
}

/// Writes pre-encoded frame bytes to `writer` and flushes.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the write or flush fails.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encodes `shape` into a frame and writes it to `writer`.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the write fails.
pub async fn send_message<W, S>(writer: &mut W, shape: &S) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    S: WireShape,
{
    let frame = encode_frame(shape);
    write_frame(writer, &frame).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
