//! Per-connection gateway logic
//!
//! Each accepted client connection is served by a loop:
//!
//! ```text
//! ReadRequest -> Proxy one request/response -> ReadRequest (keep-alive) | Close
//!             -> UpgradeToDuplex (never returns to ReadRequest)
//! ```
//!
//! Every request, and every upgraded connection, gets its own tunnel stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::{
    copy_body, error_response, read_request_head, read_response_head, BodyFraming, HttpError,
    RequestHead, DEFAULT_MAX_HEADER_BYTES,
};
use crate::gatekeeper::ConnectionHandler;
use crate::metrics::traffic::TrafficCounter;
use crate::metrics::{CountingStream, METRICS};
use crate::protocol::{frame, Destination};
use crate::proxy::{relay_until, RelayLegs};
use crate::tunnel::{TunnelError, TunnelOpener};
use crate::util::{is_closed_error, tune_tcp_stream};

/// Default bound on reading one request
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Limits applied to every client connection
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Bound on reading one request (and on the TLS handshake)
    pub read_timeout: Duration,
    /// Largest accepted header block
    pub max_header_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// How one proxied request ended
enum Exchange {
    /// Full response relayed to the client; `reusable` is false when the
    /// response ends with the connection
    Complete { reusable: bool },
    /// The gateway answers on its own, then closes
    Reply {
        code: u16,
        reason: &'static str,
        keep_alive: bool,
    },
    /// The client connection cannot be used any more
    Abort,
}

impl Exchange {
    fn bad_gateway() -> Self {
        Exchange::Reply {
            code: 502,
            reason: "Bad Gateway",
            keep_alive: false,
        }
    }
}

/// Serves the client connections of one proxy
pub struct ProxyHandler<O> {
    edge_id: u64,
    destination: Destination,
    opener: Arc<O>,
    tls: Option<TlsAcceptor>,
    settings: GatewaySettings,
    traffic: Arc<TrafficCounter>,
}

impl<O: TunnelOpener> ProxyHandler<O> {
    pub fn new(
        edge_id: u64,
        destination: Destination,
        opener: Arc<O>,
        tls: Option<TlsAcceptor>,
        settings: GatewaySettings,
        traffic: Arc<TrafficCounter>,
    ) -> Self {
        Self {
            edge_id,
            destination,
            opener,
            tls,
            settings,
            traffic,
        }
    }

    fn proxy_id(&self) -> u64 {
        self.destination.proxy_id
    }

    /// Open a tunnel stream and write the destination frame
    async fn open_tunnel(&self) -> Result<O::Stream, TunnelError> {
        let mut stream = self.opener.open_stream(self.edge_id).await.map_err(|e| {
            METRICS.stream_failed();
            e
        })?;

        if let Err(e) = frame::write_message(&mut stream, &self.destination).await {
            METRICS.stream_failed();
            return Err(e.into());
        }

        METRICS.stream_opened();
        Ok(stream)
    }

    async fn serve<C>(&self, client: C, peer: SocketAddr, shutdown: CancellationToken)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy_id = self.proxy_id();
        let limit = self.settings.max_header_bytes;
        let mut client = BufReader::new(client);

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                read = timeout(self.settings.read_timeout, read_request_head(&mut client, limit)) => Some(read),
            };

            let request = match read {
                None => {
                    debug!(proxy_id, %peer, "Listener draining, closing idle connection");
                    break;
                }
                Some(Err(_)) => {
                    debug!(proxy_id, %peer, "Client idle timeout");
                    break;
                }
                Some(Ok(Ok(None))) => break,
                Some(Ok(Ok(Some(request)))) => request,
                Some(Ok(Err(e))) if e.is_malformed() => {
                    debug!(proxy_id, %peer, error = %e, "Rejecting malformed request");
                    reply(&mut client, 400, "Bad Request", false).await;
                    break;
                }
                Some(Ok(Err(e))) => {
                    debug!(proxy_id, %peer, error = %e, "Client read failed");
                    break;
                }
            };

            METRICS.http_request();

            if request.is_websocket_upgrade() {
                self.upgrade(client, request, peer, shutdown).await;
                return;
            }

            // A draining listener answers the request in flight, then closes
            let keep_alive = request.wants_keep_alive() && !shutdown.is_cancelled();

            match self.exchange(&mut client, &request, keep_alive, peer).await {
                Exchange::Complete { reusable: true } => continue,
                Exchange::Complete { reusable: false } | Exchange::Abort => break,
                Exchange::Reply {
                    code,
                    reason,
                    keep_alive,
                } => {
                    reply(&mut client, code, reason, keep_alive).await;
                    break;
                }
            }
        }

        let _ = client.shutdown().await;
    }

    /// Proxy exactly one request over a fresh tunnel stream
    async fn exchange<C>(
        &self,
        client: &mut BufReader<C>,
        request: &RequestHead,
        keep_alive: bool,
        peer: SocketAddr,
    ) -> Exchange
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let proxy_id = self.proxy_id();

        let request_framing = match request.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                debug!(proxy_id, %peer, error = %e, "Rejecting request body framing");
                return Exchange::Reply {
                    code: 400,
                    reason: "Bad Request",
                    keep_alive: false,
                };
            }
        };

        let mut tunnel = match self.open_tunnel().await {
            Ok(stream) => BufReader::new(stream),
            Err(e) => {
                warn!(proxy_id, edge_id = self.edge_id, %peer, error = %e, "Failed to open tunnel stream");
                return Exchange::Reply {
                    code: 500,
                    reason: "Internal Server Error",
                    keep_alive,
                };
            }
        };

        let outcome = self
            .relay_exchange(client, &mut tunnel, request, request_framing, keep_alive, peer)
            .await;

        let _ = tunnel.shutdown().await;
        METRICS.stream_closed();
        debug!(proxy_id, %peer, method = %request.method, target = %request.target, "Request finished");
        outcome
    }

    async fn relay_exchange<C, T>(
        &self,
        client: &mut BufReader<C>,
        tunnel: &mut BufReader<T>,
        request: &RequestHead,
        request_framing: BodyFraming,
        keep_alive: bool,
        peer: SocketAddr,
    ) -> Exchange
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let proxy_id = self.proxy_id();
        let limit = self.settings.max_header_bytes;

        // Request head verbatim, then the body as framed by the client
        let forwarded = timeout(self.settings.read_timeout, async {
            tunnel.write_all(request.raw()).await?;
            copy_body(client, tunnel, request_framing, limit).await?;
            tunnel.flush().await?;
            Ok::<_, HttpError>(())
        })
        .await;

        match forwarded {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_malformed() => {
                return Exchange::Reply {
                    code: 400,
                    reason: "Bad Request",
                    keep_alive: false,
                }
            }
            Ok(Err(HttpError::Truncated)) => return Exchange::Abort,
            Ok(Err(e)) => {
                debug!(proxy_id, %peer, error = %e, "Forwarding request failed");
                return Exchange::bad_gateway();
            }
            Err(_) => {
                METRICS.timeout();
                debug!(proxy_id, %peer, "Timed out reading request body");
                return Exchange::Abort;
            }
        }

        // Relay interim responses until the final one arrives
        let response = loop {
            match read_response_head(tunnel, limit).await {
                Ok(Some(head)) if head.is_interim() => {
                    if write_flush(client, head.raw()).await.is_err() {
                        return Exchange::Abort;
                    }
                }
                Ok(Some(head)) => break head,
                Ok(None) => {
                    debug!(proxy_id, %peer, "Edge closed the stream without a response");
                    return Exchange::bad_gateway();
                }
                Err(e) => {
                    debug!(proxy_id, %peer, error = %e, "Unreadable response from edge");
                    return Exchange::bad_gateway();
                }
            }
        };

        // 101 outside an upgrade hands the connection to another protocol
        let keep_alive = keep_alive && response.code != 101;

        let response_framing = match response.body_framing(&request.method) {
            Ok(framing) => framing,
            Err(e) => {
                debug!(proxy_id, %peer, error = %e, "Unusable response framing from edge");
                return Exchange::bad_gateway();
            }
        };

        // A body delimited by the edge closing can only end the same way here
        let keep_alive = keep_alive && response_framing != BodyFraming::UntilClose;

        let relayed = async {
            write_flush(client, &response.rewritten(keep_alive)).await?;
            copy_body(tunnel, client, response_framing, limit).await?;
            client.flush().await?;
            Ok::<_, HttpError>(())
        }
        .await;

        match relayed {
            Ok(()) => Exchange::Complete {
                reusable: keep_alive,
            },
            Err(HttpError::Io(e)) if is_closed_error(&e) => Exchange::Abort,
            Err(e) => {
                debug!(proxy_id, %peer, code = response.code, error = %e, "Response relay ended early");
                Exchange::Abort
            }
        }
    }

    /// Turn the client connection into a raw pipe over one tunnel stream.
    ///
    /// The pipe has no read deadline; it lives until either side closes or
    /// the listener drains.
    async fn upgrade<C>(
        &self,
        mut client: BufReader<C>,
        request: RequestHead,
        peer: SocketAddr,
        shutdown: CancellationToken,
    )
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy_id = self.proxy_id();
        METRICS.http_upgrade();

        let mut tunnel = match self.open_tunnel().await {
            Ok(stream) => BufReader::new(stream),
            Err(e) => {
                warn!(proxy_id, edge_id = self.edge_id, %peer, error = %e, "Failed to open tunnel stream for upgrade");
                let _ = client.shutdown().await;
                return;
            }
        };

        if let Err(e) = write_flush(&mut tunnel, request.raw()).await {
            debug!(proxy_id, %peer, error = %e, "Forwarding upgrade request failed");
            let _ = client.shutdown().await;
            METRICS.stream_closed();
            return;
        }

        let response = match read_response_head(&mut tunnel, self.settings.max_header_bytes).await {
            Ok(Some(head)) => head,
            Ok(None) | Err(_) => {
                debug!(proxy_id, %peer, "Edge closed before answering the upgrade");
                let _ = client.shutdown().await;
                let _ = tunnel.shutdown().await;
                METRICS.stream_closed();
                return;
            }
        };

        if write_flush(&mut client, response.raw()).await.is_err() {
            let _ = tunnel.shutdown().await;
            METRICS.stream_closed();
            return;
        }

        debug!(proxy_id, %peer, code = response.code, "Upgraded connection");

        let legs = RelayLegs::new(
            format!("client {peer}"),
            format!("edge {} -> {}", self.edge_id, self.destination.addr),
        );
        let stats = relay_until(client, tunnel, legs, shutdown).await;
        METRICS.stream_closed();

        debug!(
            proxy_id,
            %peer,
            client_to_edge = stats.left_to_right,
            edge_to_client = stats.right_to_left,
            "Upgraded connection closed"
        );
    }
}

impl<O: TunnelOpener> ConnectionHandler for ProxyHandler<O> {
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        tune_tcp_stream(&stream);
        let client = CountingStream::new(stream, self.traffic.clone());

        match &self.tls {
            None => self.serve(client, peer, shutdown).await,
            Some(acceptor) => match timeout(self.settings.read_timeout, acceptor.accept(client)).await {
                Ok(Ok(tls)) => self.serve(tls, peer, shutdown).await,
                Ok(Err(e)) => {
                    debug!(proxy_id = self.proxy_id(), %peer, error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    METRICS.timeout();
                    debug!(proxy_id = self.proxy_id(), %peer, "TLS handshake timed out");
                }
            },
        }
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn reply<W: AsyncWrite + Unpin>(client: &mut W, code: u16, reason: &str, keep_alive: bool) {
    METRICS.http_synthesized_error();
    let _ = write_flush(client, &error_response(code, reason, keep_alive)).await;
}
