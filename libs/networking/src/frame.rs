//! Wire framing
//!
//! A frame is a 4-byte big-endian payload length followed by a
//! bincode-encoded [`Envelope`].

use crate::{Result, TransportError};
use bytes::{BufMut, Bytes, BytesMut};
use conclave_consensus::Envelope;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 16 MiB
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode an envelope into a complete frame
pub fn encode_frame(envelope: &Envelope, max_frame_len: usize) -> Result<Bytes> {
    let payload = bincode::serialize(envelope)?;
    let max = max_frame_len.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Read one frame; `None` on a clean end of stream between frames
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope, max_frame_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope, max_frame_len)?;
    writer.write_all(&frame).await?;
    Ok(())
}
