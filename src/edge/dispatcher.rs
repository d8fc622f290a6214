//! Edge-side tunnel stream dispatcher
//!
//! For each tunnel stream: decode the destination frame, dial the local
//! service, then relay bytes both ways until either side closes. A failure
//! before the relay starts just closes the stream; nothing is written back.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn, Span};

use crate::metrics::METRICS;
use crate::protocol::{frame, Destination, FrameError};
use crate::proxy::{relay, RelayLegs, RelayStats};
use crate::util::tune_tcp_stream;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to read destination frame: {0}")]
    Frame(#[from] FrameError),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out dialing {0}")]
    DialTimeout(String),
}

/// Dispatches tunnel streams to local services
#[derive(Debug, Clone, Default)]
pub struct EdgeStreamDispatcher {
    dial_timeout: Option<Duration>,
}

impl EdgeStreamDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound local dials; by default a dial waits as long as the OS does
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Handle one tunnel stream to completion.
    ///
    /// `label` identifies the tunnel leg in logs (e.g. the transport peer).
    #[instrument(skip(self, stream), fields(proxy_id, addr))]
    pub async fn dispatch<S>(&self, mut stream: S, label: &str) -> Result<RelayStats, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        METRICS.stream_opened();

        let destination = match frame::decode(&mut stream).await {
            Ok(destination) => destination,
            Err(e) => {
                METRICS.stream_failed();
                close_quietly(stream).await;
                return Err(e.into());
            }
        };

        Span::current().record("proxy_id", destination.proxy_id);
        Span::current().record("addr", destination.addr.as_str());

        let local = match self.dial(&destination).await {
            Ok(local) => local,
            Err(e) => {
                METRICS.stream_failed();
                close_quietly(stream).await;
                return Err(e);
            }
        };

        let legs = RelayLegs::new(
            format!("tunnel {}", label),
            format!(
                "local {} -> {}",
                local
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".to_string()),
                destination.addr
            ),
        );
        debug!(left = %legs.left, right = %legs.right, "Relaying tunnel stream");

        let stats = relay(stream, local, legs).await;

        METRICS.bytes_rx(stats.left_to_right);
        METRICS.bytes_tx(stats.right_to_left);
        METRICS.stream_closed();

        Ok(stats)
    }

    async fn dial(&self, destination: &Destination) -> Result<TcpStream, DispatchError> {
        let connect = TcpStream::connect(destination.addr.as_str());

        let result = match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| DispatchError::DialTimeout(destination.addr.clone()))?,
            None => connect.await,
        };

        match result {
            Ok(local) => {
                tune_tcp_stream(&local);
                Ok(local)
            }
            Err(source) => {
                warn!(addr = %destination.addr, error = %source, "Local dial failed");
                Err(DispatchError::Dial {
                    addr: destination.addr.clone(),
                    source,
                })
            }
        }
    }
}

async fn close_quietly<S: AsyncWrite + Unpin>(mut stream: S) {
    let _ = stream.shutdown().await;
}
