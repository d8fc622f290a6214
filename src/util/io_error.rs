//! Classification of I/O errors seen while relaying

use std::io;

/// Messages produced by transports that wrap a peer close as `ErrorKind::Other`
const CLOSED_MARKERS: &[&str] = &[
    "closed",
    "reset by peer",
    "broken pipe",
    "connection lost",
    "stopped by peer",
    "eof",
];

/// True for errors that only mean the other side went away.
///
/// These terminate a relay but are part of normal shutdown and are kept out of
/// error-level logs.
pub fn is_closed_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => true,
        _ => {
            let message = err.to_string().to_ascii_lowercase();
            CLOSED_MARKERS.iter().any(|marker| message.contains(marker))
        }
    }
}
