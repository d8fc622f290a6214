//! Edge side of the tunnel fabric

mod dispatcher;
mod handshake;

pub use dispatcher::{DispatchError, EdgeStreamDispatcher};
pub use handshake::{authenticate, HandshakeError};
