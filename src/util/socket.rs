//! Socket construction and tuning

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Socket buffer sizes for the QUIC broker endpoint
pub const UDP_RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB
pub const UDP_SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB

/// Accept backlog for gateway listeners
pub const LISTEN_BACKLOG: i32 = 1024;

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Create the UDP socket backing the broker's QUIC endpoint
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    // Large buffers for many multiplexed edges; the kernel may clamp these
    let _ = socket.set_recv_buffer_size(UDP_RECV_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(UDP_SEND_BUFFER_SIZE);

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Bind a TCP listening socket for a managed gateway port.
///
/// Binding is synchronous so the caller can hold its listener map lock across
/// the whole check-bind-insert sequence. Port 0 lets the OS pick.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;

    // Allows rebinding a port whose previous listener left TIME_WAIT sockets
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Tune an accepted or dialed TCP stream
pub fn tune_tcp_stream(stream: &tokio::net::TcpStream) {
    let _ = stream.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(60))
        .with_interval(std::time::Duration::from_secs(10));
    let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive);
}
