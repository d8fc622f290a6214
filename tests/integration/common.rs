//! Shared fixtures

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use edgeport_server::tunnel::{TunnelError, TunnelOpener};

/// Opener handing the far end of every stream to the test
pub struct ChannelOpener {
    edge_id: u64,
    streams: mpsc::UnboundedSender<DuplexStream>,
}

impl ChannelOpener {
    /// Opener for a single online edge, plus the receiver of its streams
    pub fn new(edge_id: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (streams, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { edge_id, streams }), rx)
    }
}

impl TunnelOpener for ChannelOpener {
    type Stream = DuplexStream;

    async fn open_stream(&self, edge_id: u64) -> Result<DuplexStream, TunnelError> {
        if edge_id != self.edge_id {
            return Err(TunnelError::EdgeOffline(edge_id));
        }
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.streams
            .send(far)
            .map_err(|_| TunnelError::EdgeOffline(edge_id))?;
        Ok(near)
    }
}

/// Read a header block up to and including the blank line
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "stream ended inside a header block: {head:?}");
        head.push_str(&line);
        if line == "\r\n" {
            return head;
        }
    }
}

/// Read one Content-Length framed response
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> (String, Vec<u8>) {
    let head = read_head(reader).await;
    let len = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// TCP echo service on loopback
pub async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}
