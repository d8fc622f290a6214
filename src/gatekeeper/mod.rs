//! Managed listener lifecycle
//!
//! Binds public ports on behalf of proxies, runs one accept loop per port and
//! drains connections within a bounded grace period on teardown.

mod listener;
mod manager;
mod state;

pub use listener::{ConnectionHandler, ManagedListener};
pub use manager::{GatekeeperError, PortManager, PortManagerConfig, DEFAULT_DRAIN_GRACE};
pub use state::{DrainOutcome, ListenerInfo, ListenerPhase};
