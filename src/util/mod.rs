//! Utility modules

mod io_error;
mod socket;
mod tracing_setup;

pub use io_error::is_closed_error;
pub use socket::*;
pub use tracing_setup::init_tracing;
