//! QUIC connection management
//!
//! Dials the broker, authenticates, and hands every stream the broker opens to
//! the dispatcher. A lost connection is re-established after a pause; rejected
//! credentials end the agent.

use anyhow::{Context, Result};
use quinn::{Connection, ConnectionError, Endpoint, VarInt};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use edgeport_server::broker::{QuicStream, ALPN, CLOSE_AUTH_REJECTED};
use edgeport_server::edge::{authenticate, HandshakeError};
use edgeport_server::EdgeStreamDispatcher;

use crate::config::Config;

/// Edge agent owning the broker connection
pub struct EdgeAgent {
    config: Arc<Config>,
    endpoint: Endpoint,
    dispatcher: EdgeStreamDispatcher,
    shutdown: CancellationToken,
}

/// How one session with the broker ended
enum SessionEnd {
    /// Local shutdown requested
    Shutdown,
    /// Transport lost; worth reconnecting
    Lost,
}

impl EdgeAgent {
    /// Create a new edge agent
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let endpoint = create_client_endpoint(&config)?;

        let mut dispatcher = EdgeStreamDispatcher::new();
        if let Some(limit) = config.edge.dial_timeout() {
            dispatcher = dispatcher.with_dial_timeout(limit);
        }

        Ok(Self {
            config,
            endpoint,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect and authenticate once, returning the edge id the broker assigned
    pub async fn test_connection(config: Arc<Config>) -> Result<u64> {
        let agent = Self::new(config)?;
        let connection = agent.connect().await?;

        info!(
            "Connected! Remote address: {}, Protocol: {:?}",
            connection.remote_address(),
            connection
                .handshake_data()
                .and_then(|h| h.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
                .and_then(|h| h.protocol.map(|p| String::from_utf8_lossy(&p).to_string()))
        );

        let edge_id = authenticate(&connection, &agent.config.credentials.to_credentials()).await;

        // Close connection gracefully
        connection.close(VarInt::from_u32(0), b"test complete");
        agent.endpoint.wait_idle().await;

        Ok(edge_id?)
    }

    /// Connect to the broker
    async fn connect(&self) -> Result<Connection> {
        let server_addr = resolve_address(&self.config.server.address).await?;
        let server_name = self.config.server.get_server_name().to_string();

        debug!(addr = %server_addr, name = %server_name, "Connecting to broker");

        let connecting = self.endpoint.connect(server_addr, &server_name)?;
        let connection = tokio::time::timeout(
            Duration::from_secs(self.config.edge.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", server_addr))?
        .context("Failed to establish QUIC connection")?;

        info!(addr = %connection.remote_address(), "Connected to broker");

        Ok(connection)
    }

    /// Run until shutdown, reconnecting after transport loss
    pub async fn run(&self) -> Result<()> {
        let reconnect = Duration::from_secs(self.config.edge.reconnect_interval_secs);

        loop {
            match self.session().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost) => warn!("Connection lost, attempting reconnect"),
                Err(e) => {
                    if e
                        .downcast_ref::<HandshakeError>()
                        .is_some_and(HandshakeError::is_rejection)
                    {
                        error!(error = %e, "Broker rejected this edge");
                        return Err(e);
                    }
                    error!(error = %e, "Reconnection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(reconnect) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    /// One connection lifetime: authenticate, then dispatch streams
    async fn session(&self) -> Result<SessionEnd> {
        let connection = tokio::select! {
            connected = self.connect() => connected?,
            _ = self.shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
        };

        let edge_id = authenticate(&connection, &self.config.credentials.to_credentials()).await?;
        info!(edge_id, "Edge authenticated, waiting for tunnel streams");

        let label = connection.remote_address().to_string();
        let mut streams = JoinSet::new();

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    connection.close(VarInt::from_u32(0), b"edge shutdown");
                    break SessionEnd::Shutdown;
                }

                accepted = connection.accept_bi() => match accepted {
                    Ok((send, recv)) => {
                        let dispatcher = self.dispatcher.clone();
                        let label = label.clone();
                        streams.spawn(async move {
                            if let Err(e) = dispatcher.dispatch(QuicStream::new(send, recv), &label).await {
                                debug!(error = %e, "Tunnel stream dropped");
                            }
                        });
                    }
                    Err(ConnectionError::ApplicationClosed(close)) if close.error_code == CLOSE_AUTH_REJECTED => {
                        return Err(HandshakeError::Rejected(String::from_utf8_lossy(&close.reason).into_owned()).into());
                    }
                    Err(ConnectionError::ApplicationClosed(close)) => {
                        info!(reason = %String::from_utf8_lossy(&close.reason), "Broker closed the connection");
                        break SessionEnd::Lost;
                    }
                    Err(e) => {
                        debug!(error = %e, "Stream accept error");
                        break SessionEnd::Lost;
                    }
                },

                Some(finished) = streams.join_next(), if !streams.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Tunnel stream task failed");
                    }
                }
            }
        };

        // Streams die with the connection; reap their tasks
        streams.shutdown().await;
        Ok(end)
    }

    /// Stop the agent and close the broker connection
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.endpoint.close(VarInt::from_u32(0), b"edge shutdown");
        if tokio::time::timeout(Duration::from_secs(3), self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("Broker did not acknowledge the close in time");
        }
    }
}

/// Create QUIC client endpoint
fn create_client_endpoint(config: &Config) -> Result<Endpoint> {
    let mut tls_config = if config.server.insecure {
        warn!("TLS certificate verification disabled (insecure mode)");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.server.ca_cert {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA certificate {:?}", path))?;
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to parse CA certificate")?;
            let (added, _) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                anyhow::bail!("No usable certificate in {:?}", path);
            }
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    tls_config.alpn_protocols = vec![ALPN.to_vec()];

    // Configure QUIC
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        Duration::from_secs(config.quic.idle_timeout_secs)
            .try_into()
            .context("quic.idle_timeout_secs out of range")?,
    ));
    transport.keep_alive_interval(Some(Duration::from_secs(config.quic.keep_alive_secs)));
    // The broker opens every tunnel stream
    transport.max_concurrent_bidi_streams(VarInt::from_u32(config.quic.max_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)?,
    ));
    client_config.transport_config(Arc::new(transport));

    // Create endpoint
    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// Resolve broker address
async fn resolve_address(address: &str) -> Result<SocketAddr> {
    // Try parsing as socket address first
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // DNS resolution
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("Failed to resolve {}", address))?
        .collect();

    addrs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No addresses found for {}", address))
}

/// Insecure TLS verifier for development
#[derive(Debug)]
struct InsecureServerVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_address() {
        let addr = tokio_test::block_on(resolve_address("127.0.0.1:4433")).unwrap();
        assert_eq!(addr, "127.0.0.1:4433".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_insecure_endpoint_builds() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = Config::parse(
            r#"
            [server]
            address = "127.0.0.1:4433"
            insecure = true

            [credentials]
            access_key = "ak"
            secret_key = "sk"
            "#,
        )
        .unwrap();

        assert!(EdgeAgent::new(Arc::new(config)).is_ok());
    }
}
