//! Edge side of the session handshake

use quinn::Connection;
use thiserror::Error;
use tracing::debug;

use crate::broker::CLOSE_AUTH_REJECTED;
use crate::protocol::{frame, Credentials, FrameError, HandshakeReply};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to open handshake stream: {0}")]
    Open(#[from] quinn::ConnectionError),

    #[error("handshake framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("broker rejected credentials: {0}")]
    Rejected(String),

    #[error("broker sent an empty handshake reply")]
    EmptyReply,
}

impl HandshakeError {
    /// Retrying with the same credentials cannot succeed
    pub fn is_rejection(&self) -> bool {
        matches!(self, HandshakeError::Rejected(_))
    }
}

/// Present credentials on a fresh connection and return the resolved edge id
pub async fn authenticate(
    connection: &Connection,
    credentials: &Credentials,
) -> Result<u64, HandshakeError> {
    let (mut send, mut recv) = connection.open_bi().await?;

    frame::write_message(&mut send, credentials).await?;
    let _ = send.finish();

    let reply: HandshakeReply = match frame::read_message(&mut recv).await {
        Ok(reply) => reply,
        Err(e) => {
            // The reply can be lost when the broker closes first
            if let Some(quinn::ConnectionError::ApplicationClosed(close)) = connection.close_reason() {
                if close.error_code == CLOSE_AUTH_REJECTED {
                    return Err(HandshakeError::Rejected(
                        String::from_utf8_lossy(&close.reason).into_owned(),
                    ));
                }
            }
            return Err(e.into());
        }
    };
    debug!(?reply, "Handshake reply");

    match reply {
        HandshakeReply {
            error: Some(reason),
            ..
        } => Err(HandshakeError::Rejected(reason)),
        HandshakeReply {
            edge_id: Some(edge_id),
            ..
        } => Ok(edge_id),
        _ => Err(HandshakeError::EmptyReply),
    }
}
