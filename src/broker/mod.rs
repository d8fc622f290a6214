//! QUIC broker
//!
//! Accepts outbound connections from edges, resolves their identity and
//! exposes the live connections as a [`TunnelOpener`](crate::tunnel::TunnelOpener).

mod endpoint;
mod registry;
mod session;
mod stream;

pub use endpoint::{build_server_config, load_or_generate_certs, Broker, ALPN};
pub use registry::EdgeRegistry;
pub use session::{CLOSE_AUTH_REJECTED, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_REPLACED, CLOSE_SHUTDOWN};
pub use stream::QuicStream;
