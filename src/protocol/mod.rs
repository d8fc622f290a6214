//! Tunnel wire protocol
//!
//! Length-prefixed JSON frames shared by the broker and the edge agent.

pub mod frame;
pub mod handshake;

pub use frame::{decode, encode, Destination, FrameError};
pub use handshake::{Credentials, HandshakeReply};
