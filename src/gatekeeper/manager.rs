//! Port manager
//!
//! Owns every managed listener, keyed by proxy id and by port. Both maps sit
//! behind one reader/writer lock; listener churn is rare next to per-connection
//! traffic, which never touches it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::listener::{ConnectionHandler, ManagedListener};
use super::state::{DrainOutcome, ListenerInfo};
use crate::util::bind_tcp_listener;

/// Default drain grace period
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("port {port} is already owned by proxy {owner}")]
    PortConflict { port: u16, owner: u64 },

    #[error("proxy {proxy_id} is already listening on port {port}")]
    AlreadyBound { proxy_id: u64, port: u16 },

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Port manager settings
#[derive(Debug, Clone)]
pub struct PortManagerConfig {
    /// Address managed listeners bind on
    pub bind_host: IpAddr,
    /// How long a deleted listener waits for its connections
    pub drain_grace: Duration,
}

impl Default for PortManagerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

#[derive(Default)]
struct Listeners {
    by_proxy: HashMap<u64, ManagedListener>,
    by_port: HashMap<u16, u64>,
}

/// Creates, tracks and tears down managed listeners
pub struct PortManager<H> {
    config: PortManagerConfig,
    listeners: RwLock<Listeners>,
    _handler: std::marker::PhantomData<fn(H)>,
}

impl<H: ConnectionHandler> PortManager<H> {
    pub fn new(config: PortManagerConfig) -> Self {
        Self {
            config,
            listeners: RwLock::new(Listeners::default()),
            _handler: std::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &PortManagerConfig {
        &self.config
    }

    /// Bind a listener for `proxy_id` and start accepting.
    ///
    /// Port 0 asks the OS for an ephemeral port. The bound port is returned so
    /// the caller can correct its records. Asking again for a proxy that
    /// already listens on the requested port (or on any port, when 0 is
    /// requested) returns that port and leaves `handler` unused.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_listener(
        &self,
        proxy_id: u64,
        requested_port: u16,
        handler: H,
    ) -> Result<u16, GatekeeperError> {
        let mut listeners = self.listeners.write();

        if let Some(existing) = listeners.by_proxy.get(&proxy_id) {
            if requested_port == 0 || requested_port == existing.port() {
                return Ok(existing.port());
            }
            return Err(GatekeeperError::AlreadyBound {
                proxy_id,
                port: existing.port(),
            });
        }

        if requested_port != 0 {
            if let Some(&owner) = listeners.by_port.get(&requested_port) {
                return Err(GatekeeperError::PortConflict {
                    port: requested_port,
                    owner,
                });
            }
        }

        let bind_error = |source| GatekeeperError::Bind {
            port: requested_port,
            source,
        };

        let addr = SocketAddr::new(self.config.bind_host, requested_port);
        let std_listener = bind_tcp_listener(addr).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;

        let managed = ManagedListener::start(
            proxy_id,
            listener,
            Arc::new(handler),
            self.config.drain_grace,
        )
        .map_err(bind_error)?;
        let port = managed.port();

        listeners.by_port.insert(port, proxy_id);
        listeners.by_proxy.insert(proxy_id, managed);

        info!(proxy_id, port, requested_port, "Listener created");
        Ok(port)
    }

    /// Stop and drain the listener for `proxy_id`.
    ///
    /// Tracking is dropped immediately; the call returns after the drain
    /// finished or timed out. Returns `None` if the proxy had no listener.
    pub async fn delete_listener(&self, proxy_id: u64) -> Option<DrainOutcome> {
        let managed = {
            let mut listeners = self.listeners.write();
            let managed = listeners.by_proxy.remove(&proxy_id)?;
            listeners.by_port.remove(&managed.port());
            managed
        };

        let port = managed.port();
        let outcome = managed.shutdown().await;
        if let DrainOutcome::TimedOut { severed } = outcome {
            warn!(proxy_id, port, severed, "Listener removed before its connections drained");
        }
        info!(proxy_id, port, "Listener deleted");
        Some(outcome)
    }

    /// Delete every listener in parallel; bounded by one grace period overall
    pub async fn close_all(&self) -> Vec<(u64, DrainOutcome)> {
        let drained: Vec<ManagedListener> = {
            let mut listeners = self.listeners.write();
            listeners.by_port.clear();
            listeners.by_proxy.drain().map(|(_, managed)| managed).collect()
        };

        if drained.is_empty() {
            return Vec::new();
        }

        info!(count = drained.len(), "Closing all listeners");

        let mut shutdowns = JoinSet::new();
        for managed in drained {
            shutdowns.spawn(async move {
                let proxy_id = managed.proxy_id();
                (proxy_id, managed.shutdown().await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = shutdowns.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Listener shutdown task failed"),
            }
        }
        outcomes.sort_by_key(|(proxy_id, _)| *proxy_id);
        outcomes
    }

    /// Port owned by a proxy
    pub fn port_of(&self, proxy_id: u64) -> Option<u16> {
        self.listeners.read().by_proxy.get(&proxy_id).map(|l| l.port())
    }

    /// Proxy owning a port
    pub fn owner_of(&self, port: u16) -> Option<u64> {
        self.listeners.read().by_port.get(&port).copied()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().by_proxy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ListenerInfo> {
        let mut all: Vec<ListenerInfo> = self
            .listeners
            .read()
            .by_proxy
            .values()
            .map(|l| l.info())
            .collect();
        all.sort_by_key(|info| info.proxy_id);
        all
    }
}
