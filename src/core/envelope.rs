//! # Envelope
//!
//! The unit exchanged between a [`Sender`](crate::transport::sender::Sender) and its
//! [`Receiver`](crate::transport::receiver::Receiver)s:
//!
//! ```text
//! [Length(8)] [Handle(N, UTF-8)] [Kind(1): 1=raw, 0=encoded] [Length(8)] [Payload(M)]
//! ```
//!
//! The payload is a tagged union: raw bytes travel untouched, anything else is
//! encoded with bincode and decoded by the receiving side on request.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::core::frame::{
    check_length, put_length, read_exact_or_closed, read_frame, LENGTH_PREFIX_SIZE,
};
use crate::error::{IpcError, Result};

/// Payload kind flag carried between the two frames of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Serialized object (flag 0)
    Encoded,
    /// Raw bytes (flag 1)
    Raw,
}

impl PayloadKind {
    pub fn flag(self) -> u8 {
        match self {
            PayloadKind::Encoded => 0,
            PayloadKind::Raw => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(PayloadKind::Encoded),
            1 => Ok(PayloadKind::Raw),
            other => Err(IpcError::InvalidPayloadKind(other)),
        }
    }
}

/// Message body, tagged by how it must be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Encoded(Bytes),
}

impl Payload {
    /// Wrap bytes that are sent as-is.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Payload::Raw(bytes.into())
    }

    /// Encode a value with the shared object encoding.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        // serialize_into walks the value once; serialize() sizes it first
        let mut buf = Vec::new();
        bincode::serialize_into(&mut buf, value)?;
        Ok(Payload::Encoded(Bytes::from(buf)))
    }

    pub fn from_parts(kind: PayloadKind, bytes: Bytes) -> Self {
        match kind {
            PayloadKind::Raw => Payload::Raw(bytes),
            PayloadKind::Encoded => Payload::Encoded(bytes),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::Encoded(_) => PayloadKind::Encoded,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Payload::Raw(b) | Payload::Encoded(b) => b,
        }
    }

    /// Raw bytes, or `None` for an encoded object.
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(b) => Some(b),
            Payload::Encoded(_) => None,
        }
    }

    /// Decode an encoded object. Raw payloads are rejected.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Encoded(b) => Ok(bincode::deserialize(b)?),
            Payload::Raw(_) => Err(IpcError::InvalidPayloadKind(PayloadKind::Raw.flag())),
        }
    }
}

/// Handle-tagged payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub handle: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(handle: impl Into<String>, payload: Payload) -> Self {
        Self {
            handle: handle.into(),
            payload,
        }
    }

    /// Serialize into wire bytes, ready to be written to every pooled socket.
    pub fn to_bytes(&self) -> Bytes {
        let handle = self.handle.as_bytes();
        let body = self.payload.bytes();

        let mut buf =
            BytesMut::with_capacity(2 * LENGTH_PREFIX_SIZE + 1 + handle.len() + body.len());
        put_length(&mut buf, handle.len());
        buf.extend_from_slice(handle);
        buf.put_u8(self.payload.kind().flag());
        put_length(&mut buf, body.len());
        buf.extend_from_slice(body);
        buf.freeze()
    }

    /// Read one envelope addressed to `expected_handle`.
    ///
    /// Stops with `UnexpectedHandle` when the tag does not match; the caller is
    /// expected to drop the connection. A handle frame whose length differs from
    /// `expected_handle` is rejected from its prefix alone, before its body is
    /// read or allocated.
    pub async fn read_from<R>(reader: &mut R, expected_handle: &str) -> Result<Envelope>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        read_exact_or_closed(reader, &mut prefix).await?;
        let len = check_length(i64::from_le_bytes(prefix))?;
        if len != expected_handle.len() {
            return Err(IpcError::UnexpectedHandle);
        }

        let mut handle = vec![0u8; len];
        read_exact_or_closed(reader, &mut handle).await?;
        if handle != expected_handle.as_bytes() {
            return Err(IpcError::UnexpectedHandle);
        }

        let mut flag = [0u8; 1];
        read_exact_or_closed(reader, &mut flag).await?;
        let kind = PayloadKind::from_flag(flag[0])?;
        let body = read_frame(reader).await?;

        Ok(Envelope {
            handle: expected_handle.to_string(),
            payload: Payload::from_parts(kind, body),
        })
    }
}
