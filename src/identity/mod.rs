//! Edge identity and liveness
//!
//! Resolves the credentials an edge presents when it connects, and tracks the
//! online/offline transitions of resolved edges.

mod resolver;
mod status;

pub use resolver::{EdgeRecord, IdentityError, IdentityResolver, IdentityStore, StaticIdentityStore};
pub use status::{EdgeStatus, EdgeStatusBoard, LivenessHooks};
