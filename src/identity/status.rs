//! Edge liveness bookkeeping

use dashmap::DashMap;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::METRICS;

/// Online/offline transition hooks.
///
/// The broker invokes these synchronously: `on_online` after an edge resolved
/// its identity, `on_offline` after its transport connection is gone. Both run
/// while the edge's registry slot is locked, so transitions for one edge never
/// interleave. Implementations must return promptly and must not touch the
/// broker registry.
pub trait LivenessHooks: Send + Sync + 'static {
    fn on_online(&self, edge_id: u64);
    fn on_offline(&self, edge_id: u64);
}

#[derive(Debug)]
struct EdgeEntry {
    online: bool,
    changed_at: u64,
    sessions: u64,
    work: CancellationToken,
}

/// Serializable edge status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeStatus {
    pub edge_id: u64,
    pub online: bool,
    /// Unix seconds of the last transition
    pub changed_at: u64,
    /// Number of sessions the edge has established
    pub sessions: u64,
}

/// Tracks which edges are online and owns their pending-work tokens.
///
/// Anything doing asynchronous work on behalf of an edge takes a
/// [`work_token`](Self::work_token); every such token is cancelled when the
/// edge goes offline.
#[derive(Debug, Default)]
pub struct EdgeStatusBoard {
    edges: DashMap<u64, EdgeEntry>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl EdgeStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, edge_id: u64) -> bool {
        self.edges.get(&edge_id).is_some_and(|e| e.online)
    }

    /// Token for work owned by an online edge; `None` while it is offline
    pub fn work_token(&self, edge_id: u64) -> Option<CancellationToken> {
        self.edges
            .get(&edge_id)
            .filter(|e| e.online)
            .map(|e| e.work.child_token())
    }

    pub fn status(&self, edge_id: u64) -> Option<EdgeStatus> {
        self.edges.get(&edge_id).map(|e| EdgeStatus {
            edge_id,
            online: e.online,
            changed_at: e.changed_at,
            sessions: e.sessions,
        })
    }

    pub fn list(&self) -> Vec<EdgeStatus> {
        let mut all: Vec<EdgeStatus> = self
            .edges
            .iter()
            .map(|e| EdgeStatus {
                edge_id: *e.key(),
                online: e.online,
                changed_at: e.changed_at,
                sessions: e.sessions,
            })
            .collect();
        all.sort_by_key(|s| s.edge_id);
        all
    }
}

impl LivenessHooks for EdgeStatusBoard {
    fn on_online(&self, edge_id: u64) {
        let mut entry = self.edges.entry(edge_id).or_insert_with(|| EdgeEntry {
            online: false,
            changed_at: 0,
            sessions: 0,
            work: CancellationToken::new(),
        });

        entry.sessions += 1;
        if entry.online {
            return;
        }

        entry.online = true;
        entry.changed_at = unix_now();
        if entry.work.is_cancelled() {
            entry.work = CancellationToken::new();
        }
        METRICS.edge_online();
        info!(edge_id, "Edge online");
    }

    fn on_offline(&self, edge_id: u64) {
        let Some(mut entry) = self.edges.get_mut(&edge_id) else {
            return;
        };
        if !entry.online {
            return;
        }

        entry.online = false;
        entry.changed_at = unix_now();
        entry.work.cancel();
        METRICS.edge_offline();
        info!(edge_id, "Edge offline, pending work cancelled");
    }
}
