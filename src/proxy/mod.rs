//! Byte forwarding between tunnel streams and sockets

mod relay;

pub use relay::{relay, relay_until, RelayLegs, RelayStats};
