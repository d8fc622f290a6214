//! Edgeport edge agent - Entry Point
//!
//! Dials the broker and relays tunnel streams to services on this network.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use edgeport_edge::{Config, EdgeAgent, VERSION};
use edgeport_server::util::init_tracing;

/// Edgeport edge agent
#[derive(Parser)]
#[command(name = "edgeport-edge")]
#[command(version = VERSION)]
#[command(about = "Edge agent exposing local services through an Edgeport broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the edge agent
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "edge.toml")]
        config: PathBuf,
    },
    /// Connect and authenticate once, then exit
    TestConnection {
        /// Path to configuration file
        #[arg(short, long, default_value = "edge.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_edge(config).await,
        Commands::TestConnection { config } => test_connection(config).await,
    }
}

async fn run_edge(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        "Starting Edgeport edge agent"
    );

    let config = Arc::new(config);
    let agent = EdgeAgent::new(config.clone())?;

    info!(
        server = %config.server.address,
        access_key = %config.credentials.access_key,
        "Edge agent started"
    );

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!(error = %e, "Edge agent error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            agent.shutdown().await;
        }
    }

    info!("Edge agent stopped");
    Ok(())
}

async fn test_connection(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!(server = %config.server.address, "Testing connection to broker");

    match EdgeAgent::test_connection(Arc::new(config)).await {
        Ok(edge_id) => {
            info!(edge_id, "Connection test successful");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Connection test failed");
            Err(e)
        }
    }
}

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
