//! Tunnel stream primitive
//!
//! The gateway only needs "open a byte stream to edge X". The QUIC broker
//! provides it in production; tests plug in in-memory duplex pipes.

use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::FrameError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("edge {0} is offline")]
    EdgeOffline(u64),

    #[error("failed to open stream to edge {edge_id}: {reason}")]
    Open { edge_id: u64, reason: String },

    #[error("tunnel framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens logical byte streams to connected edges
pub trait TunnelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to `edge_id`.
    ///
    /// Fails with [`TunnelError::EdgeOffline`] when the edge has no live
    /// transport connection.
    fn open_stream(
        &self,
        edge_id: u64,
    ) -> impl Future<Output = Result<Self::Stream, TunnelError>> + Send;
}
