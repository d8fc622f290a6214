//! Listener lifecycle state

use serde::Serialize;

/// Lifecycle of one managed listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListenerPhase {
    /// Creation requested, socket not bound yet
    Requested,
    /// Socket bound, accept loop not running yet
    Bound,
    /// Accepting client connections
    Accepting,
    /// Stopped accepting, waiting for in-flight connections
    Draining,
    /// Socket closed and connections finished or severed
    Closed,
}

impl ListenerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerPhase::Requested => "requested",
            ListenerPhase::Bound => "bound",
            ListenerPhase::Accepting => "accepting",
            ListenerPhase::Draining => "draining",
            ListenerPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ListenerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a listener's drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished within the grace period
    Clean,
    /// The grace period elapsed and the remaining connections were severed
    TimedOut { severed: usize },
}

/// Serializable listener snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub proxy_id: u64,
    pub port: u16,
    pub phase: ListenerPhase,
    pub active_connections: usize,
    pub uptime_secs: f64,
}
