//! QUIC broker endpoint
//!
//! Edges dial this endpoint; each accepted connection becomes a session.

use anyhow::{Context, Result};
use quinn::{Endpoint, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::EdgeRegistry;
use super::session::{SessionContext, CLOSE_SHUTDOWN};
use crate::config::{Config, QuicConfig, TlsConfig};
use crate::identity::{IdentityResolver, IdentityStore, LivenessHooks};
use crate::metrics::METRICS;

/// ALPN protocol spoken between edges and the broker
pub const ALPN: &[u8] = b"edgeport/1";

/// Upper bound on waiting for peers to acknowledge the close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// QUIC endpoint accepting edge connections
pub struct Broker<S> {
    endpoint: Endpoint,
    sessions: Arc<SessionContext<S>>,
    shutdown: CancellationToken,
}

impl<S: IdentityStore> Broker<S> {
    /// Create a broker from configuration
    pub async fn new(
        config: &Config,
        resolver: IdentityResolver<S>,
        hooks: Arc<dyn LivenessHooks>,
    ) -> Result<Self> {
        let (certs, key) = load_or_generate_certs(&config.tls).await?;
        let server_config = build_server_config(&config.quic, certs, key)?;

        Self::bind(
            config.broker.bind_addr,
            server_config,
            resolver,
            hooks,
            Duration::from_secs(config.broker.handshake_timeout_secs),
        )
    }

    /// Bind the endpoint with a ready server configuration
    pub fn bind(
        bind_addr: SocketAddr,
        server_config: ServerConfig,
        resolver: IdentityResolver<S>,
        hooks: Arc<dyn LivenessHooks>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let socket = crate::util::create_udp_socket(bind_addr)
            .with_context(|| format!("Failed to bind QUIC socket on {}", bind_addr))?;

        let runtime = quinn::default_runtime()
            .ok_or_else(|| anyhow::anyhow!("No async runtime found"))?;

        let endpoint = Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config),
            socket,
            runtime,
        )?;

        Ok(Self {
            endpoint,
            sessions: Arc::new(SessionContext {
                resolver,
                hooks,
                registry: EdgeRegistry::new(),
                handshake_timeout,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Tunnel stream opener backed by this broker's sessions
    pub fn registry(&self) -> Arc<EdgeRegistry> {
        self.sessions.registry.clone()
    }

    /// Accept edges until shutdown, then wait for every session to finish
    pub async fn run(&self) -> Result<()> {
        info!(bind_addr = %self.local_addr()?, "Broker accepting edges");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => {
                        let ctx = self.sessions.clone();
                        sessions.spawn(async move {
                            if let Err(e) = ctx.run(incoming).await {
                                METRICS.error();
                                debug!(error = %e, "Edge session ended with error");
                            }
                        });
                    }
                    // Endpoint closed
                    None => break,
                },

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Edge session task failed");
                    }
                }
            }
        }

        // Offline hooks run as each session observes its connection closing
        while sessions.join_next().await.is_some() {}

        Ok(())
    }

    /// Close every edge connection and stop accepting
    pub async fn shutdown(&self) {
        info!("Broker shutting down");
        self.shutdown.cancel();
        self.endpoint.close(CLOSE_SHUTDOWN, b"broker shutdown");

        if tokio::time::timeout(CLOSE_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            warn!("Edges did not acknowledge the close in time");
        }
    }
}

/// Build QUIC server configuration
pub fn build_server_config(
    quic: &QuicConfig,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut rustls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .context("Failed to select TLS versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Failed to build TLS config")?;

    rustls_config.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(rustls_config)?,
    ));

    let mut transport = TransportConfig::default();

    // The broker opens every tunnel stream; the edge only opens the handshake
    transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport.max_idle_timeout(Some(
        Duration::from_secs(quic.idle_timeout_secs)
            .try_into()
            .context("quic.idle_timeout_secs out of range")?,
    ));

    transport.initial_rtt(Duration::from_millis(100));
    transport.send_window(8 * 1024 * 1024);
    transport.receive_window(VarInt::from_u32(8 * 1024 * 1024));
    transport.stream_receive_window(VarInt::from_u32(2 * 1024 * 1024));

    // Keep-alive for NAT traversal
    transport.keep_alive_interval(Some(Duration::from_secs(quic.keep_alive_secs)));

    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

/// Load certificates from files or generate self-signed
pub async fn load_or_generate_certs(
    tls: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = std::path::Path::new(&tls.cert_path);
    let key_path = std::path::Path::new(&tls.key_path);

    if cert_path.exists() && key_path.exists() {
        info!(cert = %tls.cert_path, key = %tls.key_path, "Loading TLS certificates");

        let cert_pem = tokio::fs::read(cert_path)
            .await
            .context("Failed to read certificate file")?;
        let key_pem = tokio::fs::read(key_path)
            .await
            .context("Failed to read key file")?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificates")?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found in file"))?;

        Ok((certs, key))
    } else if tls.auto_generate {
        warn!("Generating self-signed certificate (not for production use)");

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("Failed to generate self-signed certificate")?;

        let cert_der = CertificateDer::from(cert.cert);
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        Ok((vec![cert_der], key_der))
    } else {
        anyhow::bail!(
            "TLS certificate not found at {} and auto_generate is disabled",
            tls.cert_path
        )
    }
}
