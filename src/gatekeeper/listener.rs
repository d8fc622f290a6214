//! Managed listener and its accept loop

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{DrainOutcome, ListenerInfo, ListenerPhase};
use crate::metrics::METRICS;

/// Serves the client connections accepted on a managed port
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one accepted connection.
    ///
    /// `shutdown` is cancelled when the listener starts draining; handlers
    /// should finish in-flight work and stop taking new work.
    fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Backoff after the process runs out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Why an accept call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptErrorClass {
    /// The listening socket itself is gone; the loop must stop
    ListenerClosed,
    /// Out of descriptors or kernel buffers; retry after a pause
    Exhausted,
    /// One bad connection; keep accepting
    Transient,
}

pub(crate) fn classify_accept_error(err: &io::Error) -> AcceptErrorClass {
    #[cfg(unix)]
    match err.raw_os_error() {
        Some(libc::EBADF) => return AcceptErrorClass::ListenerClosed,
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
            return AcceptErrorClass::Exhausted
        }
        _ => {}
    }

    match err.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected => {
            AcceptErrorClass::ListenerClosed
        }
        _ if err.to_string().contains("closed") => AcceptErrorClass::ListenerClosed,
        _ => AcceptErrorClass::Transient,
    }
}

/// Decrements the live connection count when a connection task ends,
/// including when it is aborted.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        METRICS.client_connected();
        Self(active)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
        METRICS.client_disconnected();
    }
}

/// One bound public port and the tasks serving it
pub struct ManagedListener {
    proxy_id: u64,
    port: u16,
    phase: Arc<Mutex<ListenerPhase>>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<DrainOutcome>,
    started_at: Instant,
}

impl ManagedListener {
    /// Start the accept loop on an already bound listener
    pub(crate) fn start<H: ConnectionHandler>(
        proxy_id: u64,
        listener: TcpListener,
        handler: Arc<H>,
        grace: Duration,
    ) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        let phase = Arc::new(Mutex::new(ListenerPhase::Bound));
        let active = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            AcceptContext {
                proxy_id,
                port,
                phase: phase.clone(),
                active: active.clone(),
                shutdown: shutdown.clone(),
                grace,
            },
            listener,
            handler,
        ));

        METRICS.listener_started();

        Ok(Self {
            proxy_id,
            port,
            phase,
            active,
            shutdown,
            accept_task,
            started_at: Instant::now(),
        })
    }

    pub fn proxy_id(&self) -> u64 {
        self.proxy_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn phase(&self) -> ListenerPhase {
        *self.phase.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            proxy_id: self.proxy_id,
            port: self.port,
            phase: self.phase(),
            active_connections: self.active_connections(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Stop accepting and drain.
    ///
    /// Returns once every connection finished or the grace period elapsed;
    /// the listener is closed either way.
    pub async fn shutdown(self) -> DrainOutcome {
        {
            let mut phase = self.phase.lock();
            if *phase != ListenerPhase::Closed {
                *phase = ListenerPhase::Draining;
            }
        }
        self.shutdown.cancel();

        let outcome = match self.accept_task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(proxy_id = self.proxy_id, port = self.port, error = %e, "Accept loop task failed");
                DrainOutcome::TimedOut {
                    severed: self.active.load(Ordering::Relaxed),
                }
            }
        };

        *self.phase.lock() = ListenerPhase::Closed;
        METRICS.listener_stopped();
        outcome
    }
}

struct AcceptContext {
    proxy_id: u64,
    port: u16,
    phase: Arc<Mutex<ListenerPhase>>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    grace: Duration,
}

async fn accept_loop<H: ConnectionHandler>(
    ctx: AcceptContext,
    listener: TcpListener,
    handler: Arc<H>,
) -> DrainOutcome {
    let AcceptContext {
        proxy_id,
        port,
        phase,
        active,
        shutdown,
        grace,
    } = ctx;

    *phase.lock() = ListenerPhase::Accepting;
    info!(proxy_id, port, "Listener accepting");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(proxy_id, port, %peer, "Client connected");
                    let guard = ConnectionGuard::new(active.clone());
                    let handler = handler.clone();
                    let token = shutdown.child_token();

                    connections.spawn(async move {
                        let _guard = guard;
                        handler.handle_connection(stream, peer, token).await;
                        debug!(%peer, "Client connection finished");
                    });
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptErrorClass::ListenerClosed => {
                        warn!(proxy_id, port, error = %e, "Listener closed underneath accept loop");
                        break;
                    }
                    AcceptErrorClass::Exhausted => {
                        error!(proxy_id, port, error = %e, "Out of descriptors or buffers, pausing accepts");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    AcceptErrorClass::Transient => {
                        warn!(proxy_id, port, error = %e, "Transient accept error");
                    }
                },
            },

            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        METRICS.error();
                        error!(proxy_id, port, error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    *phase.lock() = ListenerPhase::Draining;

    // Closing the socket is what stops new connections at the OS level
    drop(listener);

    let in_flight = connections.len();
    if in_flight > 0 {
        info!(proxy_id, port, in_flight, grace_secs = grace.as_secs_f64(), "Draining connections");
    }

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    let outcome = match drained {
        Ok(()) => {
            info!(proxy_id, port, "Listener drained");
            DrainOutcome::Clean
        }
        Err(_) => {
            let severed = connections.len();
            warn!(proxy_id, port, severed, "Drain grace period elapsed, severing connections");
            METRICS.timeout();
            connections.shutdown().await;
            DrainOutcome::TimedOut { severed }
        }
    };

    *phase.lock() = ListenerPhase::Closed;
    outcome
}
