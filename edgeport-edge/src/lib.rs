//! Edgeport edge agent
//!
//! Keeps one outbound QUIC connection to the broker and relays every tunnel
//! stream the broker opens to the local service it names.

pub mod config;
pub mod tunnel;

pub use config::Config;
pub use tunnel::EdgeAgent;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
