//! Destination frame codec
//!
//! Every tunnel stream starts with one frame describing where the edge should
//! relay it:
//!
//! ```text
//! [Length(4 BE)][JSON payload (Length bytes)]
//! ```
//!
//! The payload is `{"addr": "...", "application_id": N, "proxy_id": N}`.
//! Decoding reads exactly `4 + Length` bytes and never looks past the frame,
//! so whatever follows on the stream is left untouched for the payload relay.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// Largest payload accepted by the decoder
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frame codec errors. All of them leave the stream unusable.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("short read on frame length prefix")]
    ShortLength,

    #[error("short read on frame payload: expected {expected} bytes")]
    ShortPayload { expected: usize },

    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routing payload written at the head of a tunnel stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Destination {
    /// Target service on the edge (`host:port`)
    pub addr: String,
    /// Opaque application identifier
    pub application_id: u64,
    /// Opaque proxy identifier
    pub proxy_id: u64,
}

impl Destination {
    pub fn new(addr: impl Into<String>, application_id: u64, proxy_id: u64) -> Self {
        Self {
            addr: addr.into(),
            application_id,
            proxy_id,
        }
    }
}

/// Encode any serializable message as one length-prefixed frame
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Encode a destination descriptor
pub fn encode(destination: &Destination) -> Result<Bytes, FrameError> {
    encode_message(destination)
}

/// Read exactly one frame and deserialize it.
///
/// A zero length decodes to `T::default()`.
pub async fn read_message<T, R>(reader: &mut R) -> Result<T, FrameError>
where
    T: DeserializeOwned + Default,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortLength
        } else {
            FrameError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Ok(T::default());
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortPayload { expected: len }
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(serde_json::from_slice(&payload)?)
}

/// Decode a destination descriptor from the head of a stream
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Destination, FrameError> {
    read_message(reader).await
}

/// Write one frame as a single buffer
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
