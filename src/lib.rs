//! Edgeport - reverse tunnel fabric
//!
//! Exposes TCP, HTTP and WebSocket services running on NAT-bound edge devices
//! through public ports on a central broker. Edges dial out over QUIC; the
//! broker maps each client request onto a tunnel stream to the owning edge.

pub mod broker;
pub mod config;
pub mod edge;
pub mod gatekeeper;
pub mod gateway;
pub mod identity;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod tunnel;
pub mod util;

pub use broker::Broker;
pub use config::Config;
pub use edge::EdgeStreamDispatcher;
pub use gateway::Gateway;

/// Version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
