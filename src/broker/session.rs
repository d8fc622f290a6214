//! Edge session: authenticate once, then track liveness until the transport
//! connection goes away.

use anyhow::{Context, Result};
use quinn::{Connection, Incoming, VarInt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Span};

use super::registry::EdgeRegistry;
use crate::identity::{IdentityError, IdentityResolver, IdentityStore, LivenessHooks};
use crate::metrics::METRICS;
use crate::protocol::{frame, Credentials, FrameError, HandshakeReply};

/// Broker is shutting down
pub const CLOSE_SHUTDOWN: VarInt = VarInt::from_u32(0);
/// Credentials were rejected
pub const CLOSE_AUTH_REJECTED: VarInt = VarInt::from_u32(0x10);
/// No credentials arrived in time
pub const CLOSE_HANDSHAKE_TIMEOUT: VarInt = VarInt::from_u32(0x11);
/// A newer connection took over the edge id
pub const CLOSE_REPLACED: VarInt = VarInt::from_u32(0x12);

/// Time a rejection reply gets to reach the edge before the close
const REJECT_LINGER: Duration = Duration::from_millis(500);

pub(crate) struct SessionContext<S> {
    pub resolver: IdentityResolver<S>,
    pub hooks: Arc<dyn LivenessHooks>,
    pub registry: Arc<EdgeRegistry>,
    pub handshake_timeout: Duration,
}

impl<S: IdentityStore> SessionContext<S> {
    /// Serve one edge connection until it closes
    #[instrument(skip(self, incoming), fields(remote, edge_id))]
    pub async fn run(&self, incoming: Incoming) -> Result<()> {
        Span::current().record("remote", incoming.remote_address().to_string());

        let connection = incoming.await.context("QUIC handshake failed")?;

        let edge_id = match timeout(self.handshake_timeout, self.authenticate(&connection)).await {
            Ok(Ok(edge_id)) => edge_id,
            Ok(Err(e)) => {
                connection.close(CLOSE_AUTH_REJECTED, b"authentication failed");
                return Err(e);
            }
            Err(_) => {
                METRICS.timeout();
                connection.close(CLOSE_HANDSHAKE_TIMEOUT, b"handshake timeout");
                anyhow::bail!("edge did not authenticate within {:?}", self.handshake_timeout);
            }
        };
        Span::current().record("edge_id", edge_id);

        let hooks = self.hooks.as_ref();
        if let Some(previous) = self.registry.register(edge_id, connection.clone(), hooks) {
            info!("Edge reconnected, closing its previous connection");
            previous.close(CLOSE_REPLACED, b"replaced by a newer connection");
        }
        info!("Edge online");

        let reason = connection.closed().await;

        // A replacement connection keeps the edge online
        if self.registry.unregister(edge_id, connection.stable_id(), hooks) {
            info!(reason = %reason, "Edge offline");
        } else {
            debug!(reason = %reason, "Superseded edge connection closed");
        }

        Ok(())
    }

    /// Read credentials from the first stream and answer them
    async fn authenticate(&self, connection: &Connection) -> Result<u64> {
        let (mut send, mut recv) = connection
            .accept_bi()
            .await
            .context("edge closed before opening its handshake stream")?;

        let resolved = match frame::read_message::<Credentials, _>(&mut recv).await {
            Ok(credentials) => self.resolver.resolve(&credentials).await,
            Err(FrameError::Json(e)) => Err(IdentityError::Malformed(e.to_string())),
            Err(e) => return Err(e).context("failed to read credentials"),
        };

        let reply = match &resolved {
            Ok(edge_id) => HandshakeReply::accepted(*edge_id),
            Err(IdentityError::NotFound(_)) | Err(IdentityError::InvalidCredential(_)) => {
                HandshakeReply::rejected("invalid credentials")
            }
            Err(e) => HandshakeReply::rejected(e.to_string()),
        };

        frame::write_message(&mut send, &reply)
            .await
            .context("failed to send handshake reply")?;
        let _ = send.finish();

        match resolved {
            Ok(edge_id) => Ok(edge_id),
            Err(e) => {
                warn!(error = %e, "Edge authentication rejected");
                let _ = timeout(REJECT_LINGER, send.stopped()).await;
                Err(e.into())
            }
        }
    }
}
