//! Proxy routes supplied by the control plane

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::gatekeeper::GatekeeperError;
use crate::protocol::Destination;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to read {path}: {source}")]
    TlsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {0}")]
    MissingCertificate(PathBuf),

    #[error("no private key found in {0}")]
    MissingKey(PathBuf),

    #[error("invalid TLS material: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Gatekeeper(#[from] GatekeeperError),
}

/// PEM certificate chain and key for TLS termination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything the gateway needs to know about one proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub proxy_id: u64,
    /// Public port; 0 lets the OS choose
    #[serde(default)]
    pub port: u16,
    /// Edge that owns the target service
    pub edge_id: u64,
    #[serde(default)]
    pub application_id: u64,
    /// Service address as seen from the edge
    pub target: String,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

impl ProxyRoute {
    /// Destination frame written at the head of every tunnel stream
    pub fn destination(&self) -> Destination {
        Destination::new(self.target.clone(), self.application_id, self.proxy_id)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, GatewayError> {
    std::fs::read(path).map_err(|source| GatewayError::TlsRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Build a TLS acceptor from PEM files
pub fn load_tls_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, GatewayError> {
    let cert_pem = read_pem(&material.cert_path)?;
    let key_pem = read_pem(&material.key_path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| GatewayError::TlsRead {
            path: material.cert_path.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(GatewayError::MissingCertificate(material.cert_path.clone()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| GatewayError::TlsRead {
            path: material.key_path.clone(),
            source,
        })?
        .ok_or_else(|| GatewayError::MissingKey(material.key_path.clone()))?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
