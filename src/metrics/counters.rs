//! Atomic counters for hot-path metrics
//!
//! Lock-free counters that can be safely updated from any task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Gateway listeners and client connections
    pub listeners_active: AtomicU64,
    pub client_connections_total: AtomicU64,
    pub client_connections_active: AtomicU64,

    // HTTP units of work
    pub http_requests_total: AtomicU64,
    pub http_upgrades_total: AtomicU64,
    pub http_synthesized_errors: AtomicU64,

    // Tunnel streams
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub streams_failed: AtomicU64,

    // Traffic
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Edges
    pub edges_online: AtomicU64,
    pub edge_auth_failures: AtomicU64,

    // Errors
    pub errors_total: AtomicU64,
    pub timeouts_total: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            listeners_active: AtomicU64::new(0),
            client_connections_total: AtomicU64::new(0),
            client_connections_active: AtomicU64::new(0),
            http_requests_total: AtomicU64::new(0),
            http_upgrades_total: AtomicU64::new(0),
            http_synthesized_errors: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            streams_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            edges_online: AtomicU64::new(0),
            edge_auth_failures: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn listener_started(&self) {
        self.listeners_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn listener_stopped(&self) {
        self.listeners_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_connected(&self) {
        self.client_connections_total.fetch_add(1, Ordering::Relaxed);
        self.client_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_disconnected(&self) {
        self.client_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn http_request(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn http_upgrade(&self) {
        self.http_upgrades_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn http_synthesized_error(&self) {
        self.http_synthesized_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn stream_failed(&self) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_rx(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn edge_online(&self) {
        self.edges_online.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn edge_offline(&self) {
        self.edges_online.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn edge_auth_failed(&self) {
        self.edge_auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            listeners_active: self.listeners_active.load(Ordering::Relaxed),
            client_connections_total: self.client_connections_total.load(Ordering::Relaxed),
            client_connections_active: self.client_connections_active.load(Ordering::Relaxed),
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_upgrades_total: self.http_upgrades_total.load(Ordering::Relaxed),
            http_synthesized_errors: self.http_synthesized_errors.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            edges_online: self.edges_online.load(Ordering::Relaxed),
            edge_auth_failures: self.edge_auth_failures.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub listeners_active: u64,
    pub client_connections_total: u64,
    pub client_connections_active: u64,
    pub http_requests_total: u64,
    pub http_upgrades_total: u64,
    pub http_synthesized_errors: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub streams_failed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub edges_online: u64,
    pub edge_auth_failures: u64,
    pub errors_total: u64,
    pub timeouts_total: u64,
}
