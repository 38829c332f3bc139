//! # Length-Prefixed Framing
//!
//! Every unit on the wire is preceded by its length as an 8-byte little-endian
//! signed integer:
//!
//! ```text
//! [Length(8)] [Payload(N)]
//! ```
//!
//! Two flavours are provided: the async helpers [`write_frame`] / [`read_frame`]
//! for hand-rolled protocols that interleave frames with other fields (the
//! envelope's kind flag), and [`FrameCodec`] for `Framed` request/response loops.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{IpcError, Result};

/// Width of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Largest frame accepted by a reader (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Append the length prefix for a payload of `len` bytes to `dst`.
#[inline]
pub fn put_length(dst: &mut BytesMut, len: usize) {
    dst.put_i64_le(len as i64);
}

/// Validate a decoded length prefix.
#[inline]
pub fn check_length(raw: i64) -> Result<usize> {
    if raw < 0 || raw as u64 > MAX_FRAME_SIZE as u64 {
        return Err(IpcError::OversizedFrame(raw as u64));
    }
    Ok(raw as usize)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    put_length(&mut buf, payload.len());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly `buf.len()` bytes, mapping an early close to `ConnectionClosed`.
pub async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(IpcError::ConnectionClosed),
        Err(e) => Err(IpcError::Io(e)),
    }
}

/// Read one frame, blocking until the whole payload has arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_exact_or_closed(reader, &mut prefix).await?;
    let len = check_length(i64::from_le_bytes(prefix))?;

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Tokio codec for plain length-prefixed frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let len = check_length(i64::from_le_bytes(prefix))?;

        if src.len() < LENGTH_PREFIX_SIZE + len {
            src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(IpcError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        put_length(dst, item.len());
        dst.extend_from_slice(&item);
        Ok(())
    }
}
