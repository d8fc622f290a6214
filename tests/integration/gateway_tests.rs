//! Gateway end-to-end tests over an in-memory tunnel

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;

use edgeport_server::gatekeeper::{DrainOutcome, PortManagerConfig};
use edgeport_server::gateway::{GatewaySettings, ProxyRoute, TlsMaterial};
use edgeport_server::metrics::TrafficAccounting;
use edgeport_server::protocol::{frame, Destination};
use edgeport_server::Gateway;

use crate::common::{read_head, read_response, ChannelOpener};

const EDGE_ID: u64 = 42;

struct Fixture {
    gateway: Arc<Gateway<ChannelOpener>>,
    traffic: Arc<TrafficAccounting>,
    edge: mpsc::UnboundedReceiver<DuplexStream>,
}

fn fixture() -> Fixture {
    fixture_with(GatewaySettings::default(), Duration::from_secs(2))
}

fn fixture_with(settings: GatewaySettings, drain_grace: Duration) -> Fixture {
    let (opener, edge) = ChannelOpener::new(EDGE_ID);
    let traffic = TrafficAccounting::new();
    let gateway = Gateway::new(
        opener,
        traffic.clone(),
        PortManagerConfig {
            bind_host: Ipv4Addr::LOCALHOST.into(),
            drain_grace,
        },
        settings,
    );

    Fixture {
        gateway: Arc::new(gateway),
        traffic,
        edge,
    }
}

fn short_read_timeout() -> GatewaySettings {
    GatewaySettings {
        read_timeout: Duration::from_millis(200),
        ..GatewaySettings::default()
    }
}

fn route(proxy_id: u64, edge_id: u64) -> ProxyRoute {
    ProxyRoute {
        proxy_id,
        port: 0,
        edge_id,
        application_id: 3,
        target: "127.0.0.1:9000".into(),
        tls: None,
    }
}

async fn connect(port: u16) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap())
}

/// Accept the next tunnel stream and return it with its destination and request head
async fn next_request(
    edge: &mut mpsc::UnboundedReceiver<DuplexStream>,
) -> (BufReader<DuplexStream>, Destination, String) {
    let mut stream = tokio::time::timeout(Duration::from_secs(5), edge.recv())
        .await
        .expect("no tunnel stream opened")
        .unwrap();
    let destination = frame::decode(&mut stream).await.unwrap();
    let mut stream = BufReader::new(stream);
    let head = read_head(&mut stream).await;
    (stream, destination, head)
}

#[tokio::test]
async fn test_request_is_framed_and_relayed() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: gw\r\n\r\n")
        .await
        .unwrap();

    let (mut tunnel, destination, head) = next_request(&mut f.edge).await;
    assert_eq!(destination, Destination::new("127.0.0.1:9000", 3, 7));
    assert_eq!(head, "GET /hello HTTP/1.1\r\nHost: gw\r\n\r\n");

    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    // The edge's connection choice never leaks to the client
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(!head.contains("Connection: close"));
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_keep_alive_uses_a_stream_per_request() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();
    let mut client = connect(port).await;

    for path in ["/one", "/two"] {
        client
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: gw\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let (mut tunnel, _, head) = next_request(&mut f.edge).await;
        assert!(head.starts_with(&format!("GET {path} ")));
        tunnel
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 204"));
        assert!(body.is_empty());
    }
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: gw\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"ok");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_request_body_and_chunked_response() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(b"POST /submit HTTP/1.1\r\nHost: gw\r\nContent-Length: 4\r\n\r\nping")
        .await
        .unwrap();

    let (mut tunnel, _, head) = next_request(&mut f.edge).await;
    assert!(head.contains("Content-Length: 4\r\n"));
    let mut body = [0u8; 4];
    tunnel.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ping");

    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npong\r\n0\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));

    let mut chunked = vec![0u8; b"4\r\npong\r\n0\r\n\r\n".len()];
    client.read_exact(&mut chunked).await.unwrap();
    assert_eq!(chunked, b"4\r\npong\r\n0\r\n\r\n");
}

#[tokio::test]
async fn test_close_delimited_response_ends_the_connection() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await.unwrap();

    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed until close")
        .await
        .unwrap();
    drop(tunnel);

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(!head.contains("Content-Length"));

    let mut body = Vec::new();
    client.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"streamed until close");
}

#[tokio::test]
async fn test_close_delimited_response_is_not_buffered() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(b"GET /events HTTP/1.1\r\nHost: gw\r\n\r\n")
        .await
        .unwrap();

    // The edge keeps the stream open after the first event
    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: 1\n\n")
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), async {
        let head = read_head(&mut client).await;
        let mut event = [0u8; 9];
        client.read_exact(&mut event).await.unwrap();
        (head, event)
    })
    .await
    .expect("event held back until the edge closed");
    assert!(first.0.contains("Connection: close\r\n"));
    assert_eq!(&first.1, b"data: 1\n\n");

    tunnel.write_all(b"data: 2\n\n").await.unwrap();
    drop(tunnel);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"data: 2\n\n");
}

#[tokio::test]
async fn test_offline_edge_gets_500() {
    let f = fixture();
    let port = f.gateway.create_proxy(&route(8, 99)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await.unwrap();

    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 500 "));

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_edge_closing_early_gets_502() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await.unwrap();

    let (tunnel, _, _) = next_request(&mut f.edge).await;
    drop(tunnel);

    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502 "));
    assert!(head.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();

    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400 "));
}

#[tokio::test]
async fn test_websocket_upgrade_becomes_duplex() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: gw\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let (mut tunnel, destination, head) = next_request(&mut f.edge).await;
    assert_eq!(destination.proxy_id, 7);
    assert!(head.contains("Upgrade: websocket\r\n"));

    tunnel
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 "));

    // Raw bytes in both directions from here on
    client.write_all(b"frame-up").await.unwrap();
    let mut up = [0u8; 8];
    tunnel.read_exact(&mut up).await.unwrap();
    assert_eq!(&up, b"frame-up");

    tunnel.write_all(b"frame-down").await.unwrap();
    let mut down = [0u8; 10];
    client.read_exact(&mut down).await.unwrap();
    assert_eq!(&down, b"frame-down");

    drop(tunnel);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_traffic_is_counted_per_proxy() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n";
    let mut client = connect(port).await;
    client.write_all(request).await.unwrap();

    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
    read_response(&mut client).await;

    let samples = f.traffic.take_samples();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].proxy_id, 7);
    assert_eq!(samples[0].application_id, 3);
    assert_eq!(samples[0].bytes_in, request.len() as u64);
    assert!(samples[0].bytes_out > 0);
}

#[tokio::test]
async fn test_delete_finishes_in_flight_request() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await.unwrap();
    let (mut tunnel, _, _) = next_request(&mut f.edge).await;

    let gateway = f.gateway.clone();
    let teardown = tokio::spawn(async move { gateway.delete_proxy(7).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No new connections once deletion starts
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());

    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"done");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let teardown = teardown.await.unwrap().expect("proxy existed");
    assert_eq!(teardown.drain, DrainOutcome::Clean);
    assert_eq!(teardown.unflushed.len(), 1);
    assert!(f.gateway.port_of(7).is_none());
}

#[tokio::test]
async fn test_duplicate_port_is_rejected() {
    let f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut clash = route(8, EDGE_ID);
    clash.port = port;
    assert!(f.gateway.create_proxy(&clash).is_err());

    // Same proxy again is idempotent
    assert_eq!(f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap(), port);
    assert_eq!(f.gateway.listeners().len(), 1);
}

#[tokio::test]
async fn test_failed_create_leaves_no_traffic_counter() {
    let f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut clash = route(8, EDGE_ID);
    clash.port = port;
    assert!(f.gateway.create_proxy(&clash).is_err());
    assert_eq!(f.traffic.len(), 1);

    f.gateway.delete_proxy(7).await.unwrap();
    assert!(f.traffic.is_empty());
}

#[tokio::test]
async fn test_chunked_request_with_content_length_gets_400() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(
            b"POST / HTTP/1.1\r\nHost: gw\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400 "));
    assert!(head.contains("Connection: close\r\n"));

    // Nothing reached the edge
    assert!(f.edge.try_recv().is_err());
}

#[tokio::test]
async fn test_idle_client_is_closed_after_read_timeout() {
    let mut f = fixture_with(short_read_timeout(), Duration::from_secs(2));
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client.write_all(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await.unwrap();
    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client).await;
    assert!(head.contains("Connection: keep-alive\r\n"));

    // Kept alive, then dropped once no next request shows up
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("idle connection left open")
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_upgraded_connection_outlives_read_timeout() {
    let mut f = fixture_with(short_read_timeout(), Duration::from_secs(2));
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: gw\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    read_head(&mut client).await;

    // Quiet for twice the read timeout
    tokio::time::sleep(Duration::from_millis(400)).await;

    client.write_all(b"ping").await.unwrap();
    let mut up = [0u8; 4];
    tunnel.read_exact(&mut up).await.unwrap();
    assert_eq!(&up, b"ping");

    tunnel.write_all(b"pong").await.unwrap();
    let mut down = [0u8; 4];
    client.read_exact(&mut down).await.unwrap();
    assert_eq!(&down, b"pong");
}

#[tokio::test]
async fn test_delete_closes_upgraded_connection() {
    let mut f = fixture();
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: gw\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let (mut tunnel, _, _) = next_request(&mut f.edge).await;
    tunnel
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    read_head(&mut client).await;

    client.write_all(b"before").await.unwrap();
    let mut up = [0u8; 6];
    tunnel.read_exact(&mut up).await.unwrap();

    let teardown = f.gateway.delete_proxy(7).await.unwrap();
    assert_eq!(teardown.drain, DrainOutcome::Clean);

    // Once delete returns, nothing bridges the two sides any more
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
        .await
        .expect("client side left open")
        .unwrap();
    assert!(rest.is_empty());

    let _ = client.write_all(b"after").await;
    let mut leaked = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), tunnel.read_to_end(&mut leaked))
        .await
        .expect("tunnel side left open")
        .unwrap();
    assert!(leaked.is_empty());
}

#[tokio::test]
async fn test_stalled_upgrade_is_severed_after_grace() {
    let mut f = fixture_with(GatewaySettings::default(), Duration::from_millis(200));
    let port = f.gateway.create_proxy(&route(7, EDGE_ID)).unwrap();

    let mut client = connect(port).await;
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: gw\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    // The edge never answers the upgrade
    let (mut tunnel, _, _) = next_request(&mut f.edge).await;

    let teardown = f.gateway.delete_proxy(7).await.unwrap();
    assert_eq!(teardown.drain, DrainOutcome::TimedOut { severed: 1 });

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
        .await
        .expect("client side left open")
        .unwrap();
    assert!(rest.is_empty());

    let mut leaked = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), tunnel.read_to_end(&mut leaked))
        .await
        .expect("tunnel side left open")
        .unwrap();
    assert!(leaked.is_empty());
}

#[tokio::test]
async fn test_tls_proxy_round_trip() {
    let dir = std::env::temp_dir().join(format!("edgeport-gateway-tls-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let material = TlsMaterial {
        cert_path: dir.join("cert.pem"),
        key_path: dir.join("key.pem"),
    };
    std::fs::write(&material.cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&material.key_path, generated.key_pair.serialize_pem()).unwrap();

    let mut f = fixture();
    let mut tls_route = route(9, EDGE_ID);
    tls_route.tls = Some(material);
    let port = f.gateway.create_proxy(&tls_route).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(generated.cert.der().clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let tcp = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let mut client = BufReader::new(tls);

    client
        .write_all(b"GET /secure HTTP/1.1\r\nHost: gw\r\n\r\n")
        .await
        .unwrap();

    // The edge sees plaintext
    let (mut tunnel, destination, head) = next_request(&mut f.edge).await;
    assert_eq!(destination.proxy_id, 9);
    assert_eq!(head, "GET /secure HTTP/1.1\r\nHost: gw\r\n\r\n");

    tunnel
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"secret");

    let _ = std::fs::remove_dir_all(&dir);
}
