//! Framing of encoded messages on a byte stream.
//!
//! A frame is a 4-byte big-endian magic number followed by one encoded
//! message tree. The length in the message header tells the reader how
//! much more to read.

use crate::codec::{self, CodecError, HEADER_SIZE, Tlv};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame marker.
pub const MAGIC: u32 = 0x5748_4a4d;

/// Largest encoded message accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 20 * 1024;

/// Largest payload a client may send in one `SEND` request.
pub const MAX_SEND_SIZE: usize = 1024;

/// Errors from sending or receiving a frame.
///
/// Any of these on a receive means the peer is gone or broken.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Codec(#[source] CodecError),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

fn read_error(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// Write one framed message. Oversized messages fail before any byte is written.
pub async fn send<W>(writer: &mut W, msg: &Tlv) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = msg.encode(MAX_FRAME_SIZE).map_err(|e| match e {
        CodecError::TooLarge { size, .. } => TransportError::TooLarge(size),
        other => TransportError::Codec(other),
    })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await.map_err(TransportError::Io)?;
    writer.flush().await.map_err(TransportError::Io)
}

/// Read one framed message.
///
/// Cancel safety: not cancel safe; a partially read frame is lost.
pub async fn recv<R>(reader: &mut R) -> Result<Tlv, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await.map_err(read_error)?;
    let magic = u32::from_be_bytes(magic);
    if magic != MAGIC {
        return Err(TransportError::BadMagic(magic));
    }

    let mut frame = vec![0u8; HEADER_SIZE];
    reader.read_exact(&mut frame).await.map_err(read_error)?;
    let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let padded = len.saturating_add(7) & !7;
    let total = HEADER_SIZE.saturating_add(padded);
    if total > MAX_FRAME_SIZE {
        return Err(TransportError::TooLarge(total));
    }

    frame.resize(total, 0);
    reader
        .read_exact(&mut frame[HEADER_SIZE..])
        .await
        .map_err(read_error)?;

    codec::decode_message(&frame).map_err(TransportError::Codec)
}
