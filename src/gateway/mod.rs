//! Entry-side HTTP/WebSocket gateway
//!
//! One managed listener per proxy. Client requests are mapped onto tunnel
//! streams to the edge that owns the proxy's target.

mod http;
mod route;
mod server;

pub use http::{
    read_request_head, read_response_head, BodyFraming, HttpError, RequestHead, ResponseHead,
    DEFAULT_MAX_HEADER_BYTES,
};
pub use route::{load_tls_acceptor, GatewayError, ProxyRoute, TlsMaterial};
pub use server::{GatewaySettings, ProxyHandler, DEFAULT_READ_TIMEOUT};

use std::sync::Arc;
use tracing::info;

use crate::gatekeeper::{DrainOutcome, ListenerInfo, PortManager, PortManagerConfig};
use crate::metrics::{TrafficAccounting, TrafficSample};
use crate::tunnel::TunnelOpener;

/// Result of tearing down one proxy
#[derive(Debug)]
pub struct ProxyTeardown {
    pub drain: DrainOutcome,
    /// Traffic counted since the last flush
    pub unflushed: Vec<TrafficSample>,
}

/// Creates and deletes proxies on top of the port manager
pub struct Gateway<O: TunnelOpener> {
    opener: Arc<O>,
    traffic: Arc<TrafficAccounting>,
    settings: GatewaySettings,
    ports: PortManager<ProxyHandler<O>>,
}

impl<O: TunnelOpener> Gateway<O> {
    pub fn new(
        opener: Arc<O>,
        traffic: Arc<TrafficAccounting>,
        ports: PortManagerConfig,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            opener,
            traffic,
            settings,
            ports: PortManager::new(ports),
        }
    }

    /// Start serving a proxy; returns the port actually bound
    pub fn create_proxy(&self, route: &ProxyRoute) -> Result<u16, GatewayError> {
        let tls = route.tls.as_ref().map(load_tls_acceptor).transpose()?;

        let handler = ProxyHandler::new(
            route.edge_id,
            route.destination(),
            self.opener.clone(),
            tls,
            self.settings.clone(),
            self.traffic.counter(route.proxy_id, route.application_id),
        );

        let port = self
            .ports
            .create_listener(route.proxy_id, route.port, handler)
            .map_err(|e| {
                // A proxy that already listens keeps its counter
                if self.ports.port_of(route.proxy_id).is_none() {
                    self.traffic.remove_proxy(route.proxy_id);
                }
                e
            })?;

        info!(
            proxy_id = route.proxy_id,
            port,
            edge_id = route.edge_id,
            target = %route.target,
            tls = route.tls.is_some(),
            "Proxy created"
        );
        Ok(port)
    }

    /// Stop a proxy and drain its connections
    pub async fn delete_proxy(&self, proxy_id: u64) -> Option<ProxyTeardown> {
        let drain = self.ports.delete_listener(proxy_id).await?;
        Some(ProxyTeardown {
            drain,
            unflushed: self.traffic.remove_proxy(proxy_id),
        })
    }

    /// Stop every proxy; bounded by one drain grace period
    pub async fn close_all(&self) -> Vec<(u64, DrainOutcome)> {
        self.ports.close_all().await
    }

    pub fn port_of(&self, proxy_id: u64) -> Option<u16> {
        self.ports.port_of(proxy_id)
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.ports.list()
    }
}
