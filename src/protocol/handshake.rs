//! Session handshake messages
//!
//! An edge opens one bidirectional stream right after connecting and sends its
//! credentials in the same length-prefixed JSON framing used for destination
//! frames. The broker answers with the resolved edge id or an error.

use serde::{Deserialize, Serialize};

/// Access credential pair presented by an edge
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Broker answer to a handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeReply {
    pub fn accepted(edge_id: u64) -> Self {
        Self {
            edge_id: Some(edge_id),
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            edge_id: None,
            error: Some(reason.into()),
        }
    }
}
