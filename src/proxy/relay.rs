//! Bidirectional byte relay
//!
//! Runs one pump per direction inside the calling task, so aborting that task
//! tears both directions down. When either direction ends, for any reason,
//! both sides are closed so the sibling pump unblocks too. The relay returns
//! only after both pumps have finished.

use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::util::is_closed_error;

/// Per-direction copy buffer
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on flushing a half-closed writer
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Human-readable description of the two legs, used in logs
#[derive(Debug, Clone)]
pub struct RelayLegs {
    pub left: String,
    pub right: String,
}

impl RelayLegs {
    pub fn new(left: impl fmt::Display, right: impl fmt::Display) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub left_to_right: u64,
    pub right_to_left: u64,
}

/// Relay between `left` and `right` until either direction ends
pub async fn relay<L, R>(left: L, right: R, legs: RelayLegs) -> RelayStats
where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    relay_until(left, right, legs, CancellationToken::new()).await
}

/// Like [`relay`], but also closes both sides once `stop` is cancelled
pub async fn relay_until<L, R>(
    left: L,
    right: R,
    legs: RelayLegs,
    stop: CancellationToken,
) -> RelayStats
where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    let closed = stop.child_token();

    // Both directions are always joined, even though the first one to finish
    // already closed everything.
    let (left_to_right, right_to_left) = tokio::join!(
        pump(left_read, right_write, closed.clone(), &legs.left, &legs.right),
        pump(right_read, left_write, closed, &legs.right, &legs.left),
    );

    let stats = RelayStats {
        left_to_right,
        right_to_left,
    };

    debug!(
        left = %legs.left,
        right = %legs.right,
        left_to_right = stats.left_to_right,
        right_to_left = stats.right_to_left,
        "Relay finished"
    );

    stats
}

/// Copy `reader` into `writer` until EOF, an error, or the sibling closing
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    closed: CancellationToken,
    from: &str,
    to: &str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total: u64 = 0;

    let result: io::Result<()> = loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
            _ = closed.cancelled() => break Ok(()),
        };

        tokio::select! {
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
            }
            _ = closed.cancelled() => break Ok(()),
        }

        total += n as u64;
    };

    // Close both sides. Cancelling twice and shutting down an already closed
    // writer are both no-ops.
    closed.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;

    match result {
        Ok(()) => {}
        Err(e) if is_closed_error(&e) => {
            debug!(%from, %to, error = %e, "Relay peer closed");
        }
        Err(e) => {
            warn!(%from, %to, error = %e, bytes = total, "Relay error");
        }
    }

    total
}
