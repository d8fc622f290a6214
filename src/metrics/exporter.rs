//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping, fed from the atomic counters.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::counters::{MetricsSnapshot, METRICS};
use crate::config::MetricsConfig;

const COUNTERS: &[(&str, &str)] = &[
    ("edgeport_client_connections_total", "Client connections accepted on gateway ports"),
    ("edgeport_http_requests_total", "HTTP requests proxied as discrete units"),
    ("edgeport_http_upgrades_total", "Client connections upgraded to duplex relays"),
    ("edgeport_http_synthesized_errors", "Error responses generated by the gateway"),
    ("edgeport_streams_opened", "Tunnel streams opened"),
    ("edgeport_streams_closed", "Tunnel streams closed"),
    ("edgeport_streams_failed", "Tunnel streams that could not be opened or framed"),
    ("edgeport_bytes_received", "Bytes received from clients and edges"),
    ("edgeport_bytes_sent", "Bytes sent to clients and edges"),
    ("edgeport_edge_auth_failures", "Rejected edge handshakes"),
    ("edgeport_errors_total", "Total errors"),
    ("edgeport_timeouts_total", "Total timeouts"),
];

const GAUGES: &[(&str, &str)] = &[
    ("edgeport_listeners_active", "Managed gateway listeners currently bound"),
    ("edgeport_client_connections_active", "Client connections currently open"),
    ("edgeport_edges_online", "Edges with a live transport connection"),
];

/// Initialize the Prometheus exporter and the counter sync task
pub fn init_metrics(config: &MetricsConfig, shutdown: CancellationToken) -> Result<()> {
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    for (name, help) in GAUGES {
        describe_gauge!(*name, *help);
    }

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    tokio::spawn(sync_metrics_task(shutdown));

    Ok(())
}

fn counter_values(s: &MetricsSnapshot) -> [u64; 12] {
    [
        s.client_connections_total,
        s.http_requests_total,
        s.http_upgrades_total,
        s.http_synthesized_errors,
        s.streams_opened,
        s.streams_closed,
        s.streams_failed,
        s.bytes_received,
        s.bytes_sent,
        s.edge_auth_failures,
        s.errors_total,
        s.timeouts_total,
    ]
}

/// Periodically push counter deltas and gauge levels into the recorder
async fn sync_metrics_task(shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last = counter_values(&METRICS.snapshot());

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let snapshot = METRICS.snapshot();
        let current = counter_values(&snapshot);

        for (i, (name, _)) in COUNTERS.iter().enumerate() {
            let delta = current[i].saturating_sub(last[i]);
            if delta > 0 {
                counter!(*name).increment(delta);
            }
        }

        gauge!("edgeport_listeners_active").set(snapshot.listeners_active as f64);
        gauge!("edgeport_client_connections_active")
            .set(snapshot.client_connections_active as f64);
        gauge!("edgeport_edges_online").set(snapshot.edges_online as f64);

        last = current;
    }
}
