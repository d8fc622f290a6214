//! Edgeport broker - Entry Point
//!
//! Runs the QUIC broker and the gateway listeners declared in the config file.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use edgeport_server::gatekeeper::DrainOutcome;
use edgeport_server::identity::{EdgeStatusBoard, IdentityResolver};
use edgeport_server::metrics::traffic::spawn_flush_task;
use edgeport_server::metrics::{init_metrics, LogSink, TrafficAccounting};
use edgeport_server::{Broker, Config, Gateway, VERSION};

/// Application entry point
fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.broker.effective_workers())
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(run(config, config_path))
}

async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    // Install the ring crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    edgeport_server::util::init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        workers = config.broker.effective_workers(),
        "Starting Edgeport broker"
    );

    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        init_metrics(&config.metrics, shutdown.clone())?;
        info!(bind_addr = %config.metrics.bind_addr, "Metrics endpoint started");
    }

    let status = Arc::new(EdgeStatusBoard::new());
    let resolver = IdentityResolver::new(config.identity_store());
    let broker = Arc::new(Broker::new(&config, resolver, status.clone()).await?);

    info!(
        bind_addr = %broker.local_addr()?,
        edges = config.edges.len(),
        "Broker listening"
    );

    let traffic = TrafficAccounting::new();
    let flush_task = spawn_flush_task(
        traffic.clone(),
        Arc::new(LogSink),
        Duration::from_secs(config.metrics.traffic_flush_secs),
        shutdown.clone(),
    );

    let gateway = Gateway::new(
        broker.registry(),
        traffic,
        config.gateway.port_manager(),
        config.gateway.settings(),
    );

    for route in &config.proxies {
        if let Err(e) = gateway.create_proxy(route) {
            error!(proxy_id = route.proxy_id, port = route.port, error = %e, "Failed to create proxy");
        }
    }

    let mut broker_task = tokio::spawn({
        let broker = broker.clone();
        async move { broker.run().await }
    });

    let broker_finished = tokio::select! {
        joined = &mut broker_task => {
            match joined {
                Ok(Ok(())) => warn!("Broker endpoint closed"),
                Ok(Err(e)) => error!(error = %e, "Broker error"),
                Err(e) => error!(error = %e, "Broker task failed"),
            }
            true
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining listeners...");
            false
        }
    };

    let outcomes = gateway.close_all().await;
    let severed: usize = outcomes
        .iter()
        .map(|(_, outcome)| match outcome {
            DrainOutcome::Clean => 0,
            DrainOutcome::TimedOut { severed } => *severed,
        })
        .sum();
    info!(listeners = outcomes.len(), severed, "Gateway listeners closed");

    broker.shutdown().await;
    if !broker_finished {
        let _ = broker_task.await;
    }

    let still_online = status.list().iter().filter(|edge| edge.online).count();
    if still_online > 0 {
        warn!(still_online, "Edges still marked online after broker shutdown");
    }

    shutdown.cancel();
    let _ = flush_task.await;

    info!("Broker stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
