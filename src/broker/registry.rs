//! Live edge connections
//!
//! An edge appears here only after its identity resolved, so a registry entry
//! is what makes an edge reachable for tunnel streams.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quinn::Connection;
use std::sync::Arc;
use tracing::debug;

use super::stream::QuicStream;
use crate::identity::LivenessHooks;
use crate::tunnel::{TunnelError, TunnelOpener};

#[derive(Debug, Default)]
pub struct EdgeRegistry {
    connections: DashMap<u64, Connection>,
}

impl EdgeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a connection to an edge, returning the one it replaces.
    ///
    /// `on_online` runs while the edge's slot is locked, so it is ordered
    /// with the `on_offline` of any earlier connection. Hooks must not call
    /// back into the registry.
    pub(crate) fn register(
        &self,
        edge_id: u64,
        connection: Connection,
        hooks: &dyn LivenessHooks,
    ) -> Option<Connection> {
        match self.connections.entry(edge_id) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(connection);
                hooks.on_online(edge_id);
                Some(previous)
            }
            Entry::Vacant(slot) => {
                let _slot = slot.insert(connection);
                hooks.on_online(edge_id);
                None
            }
        }
    }

    /// Detach the edge if `stable_id` still owns its slot, running
    /// `on_offline` before the slot is released
    pub(crate) fn unregister(&self, edge_id: u64, stable_id: usize, hooks: &dyn LivenessHooks) -> bool {
        match self.connections.entry(edge_id) {
            Entry::Occupied(slot) if slot.get().stable_id() == stable_id => {
                hooks.on_offline(edge_id);
                slot.remove();
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, edge_id: u64) -> bool {
        self.connections.contains_key(&edge_id)
    }

    pub fn connected_edges(&self) -> Vec<u64> {
        let mut edges: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        edges.sort_unstable();
        edges
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl TunnelOpener for EdgeRegistry {
    type Stream = QuicStream;

    async fn open_stream(&self, edge_id: u64) -> Result<QuicStream, TunnelError> {
        let connection = self
            .connections
            .get(&edge_id)
            .map(|entry| entry.value().clone())
            .ok_or(TunnelError::EdgeOffline(edge_id))?;

        let (send, recv) = connection.open_bi().await.map_err(|e| TunnelError::Open {
            edge_id,
            reason: e.to_string(),
        })?;

        debug!(edge_id, stream = %send.id(), "Opened tunnel stream");
        Ok(QuicStream::new(send, recv))
    }
}
