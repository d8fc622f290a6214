//! Credential to edge identity resolution

use ring::digest::{digest, SHA256};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::METRICS;
use crate::protocol::Credentials;

/// Identity resolution failures. Every variant rejects the session.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown access key {0:?}")]
    NotFound(String),

    #[error("invalid credential for access key {0:?}")]
    InvalidCredential(String),

    #[error("malformed credential payload: {0}")]
    Malformed(String),

    #[error("identity store error: {0}")]
    Store(String),
}

/// Stored identity for one access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub edge_id: u64,
    pub secret_key: String,
}

/// External identity store
pub trait IdentityStore: Send + Sync + 'static {
    fn lookup(
        &self,
        access_key: &str,
    ) -> impl Future<Output = Result<Option<EdgeRecord>, IdentityError>> + Send;
}

/// In-memory store, typically filled from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityStore {
    edges: HashMap<String, EdgeRecord>,
}

impl StaticIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, access_key: impl Into<String>, edge_id: u64, secret_key: impl Into<String>) {
        self.edges.insert(
            access_key.into(),
            EdgeRecord {
                edge_id,
                secret_key: secret_key.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl IdentityStore for StaticIdentityStore {
    async fn lookup(&self, access_key: &str) -> Result<Option<EdgeRecord>, IdentityError> {
        Ok(self.edges.get(access_key).cloned())
    }
}

/// Resolves presented credentials to a stable edge id
pub struct IdentityResolver<S> {
    store: S,
}

impl<S: IdentityStore> IdentityResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Resolve a credential pair
    pub async fn resolve(&self, credentials: &Credentials) -> Result<u64, IdentityError> {
        let record = self
            .store
            .lookup(&credentials.access_key)
            .await?
            .ok_or_else(|| {
                METRICS.edge_auth_failed();
                IdentityError::NotFound(credentials.access_key.clone())
            })?;

        if !secrets_match(&record.secret_key, &credentials.secret_key) {
            METRICS.edge_auth_failed();
            warn!(access_key = %credentials.access_key, "Edge presented a mismatched secret");
            return Err(IdentityError::InvalidCredential(
                credentials.access_key.clone(),
            ));
        }

        debug!(access_key = %credentials.access_key, edge_id = record.edge_id, "Edge identity resolved");
        Ok(record.edge_id)
    }

    /// Resolve a raw JSON credential payload
    pub async fn resolve_payload(&self, payload: &[u8]) -> Result<u64, IdentityError> {
        let credentials: Credentials = serde_json::from_slice(payload)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        self.resolve(&credentials).await
    }
}

/// Compare secrets through fixed-length digests, without early exit
fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = digest(&SHA256, expected.as_bytes());
    let presented = digest(&SHA256, presented.as_bytes());

    expected
        .as_ref()
        .iter()
        .zip(presented.as_ref())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
