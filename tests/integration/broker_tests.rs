//! Broker and edge over a real QUIC connection on loopback

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use edgeport_server::broker::{build_server_config, QuicStream, ALPN};
use edgeport_server::config::QuicConfig;
use edgeport_server::edge::{authenticate, HandshakeError};
use edgeport_server::identity::{
    EdgeStatusBoard, IdentityResolver, LivenessHooks, StaticIdentityStore,
};
use edgeport_server::protocol::{frame, Credentials, Destination};
use edgeport_server::tunnel::{TunnelError, TunnelOpener};
use edgeport_server::{Broker, EdgeStreamDispatcher};

use crate::common::spawn_echo_server;

/// Status board that also keeps every transition in order
#[derive(Default)]
struct RecordingBoard {
    board: EdgeStatusBoard,
    transitions: Mutex<Vec<bool>>,
}

impl RecordingBoard {
    fn is_online(&self, edge_id: u64) -> bool {
        self.board.is_online(edge_id)
    }

    fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().clone()
    }
}

impl LivenessHooks for RecordingBoard {
    fn on_online(&self, edge_id: u64) {
        self.transitions.lock().push(true);
        self.board.on_online(edge_id);
    }

    fn on_offline(&self, edge_id: u64) {
        self.transitions.lock().push(false);
        self.board.on_offline(edge_id);
    }
}

struct Harness {
    broker: Arc<Broker<StaticIdentityStore>>,
    board: Arc<RecordingBoard>,
    addr: SocketAddr,
    cert: CertificateDer<'static>,
}

fn start_broker() -> Harness {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = CertificateDer::from(generated.cert);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
    let server_config = build_server_config(&QuicConfig::default(), vec![cert.clone()], key).unwrap();

    let mut store = StaticIdentityStore::new();
    store.insert("edge-ak", 42, "edge-sk");

    let board = Arc::new(RecordingBoard::default());
    let broker = Arc::new(
        Broker::bind(
            (Ipv4Addr::LOCALHOST, 0).into(),
            server_config,
            IdentityResolver::new(store),
            board.clone(),
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let addr = broker.local_addr().unwrap();

    let runner = broker.clone();
    tokio::spawn(async move { runner.run().await });

    Harness {
        broker,
        board,
        addr,
        cert,
    }
}

async fn dial(harness: &Harness) -> (quinn::Endpoint, quinn::Connection) {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(harness.cert.clone()).unwrap();

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap(),
    ));

    let mut endpoint = quinn::Endpoint::client((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    endpoint.set_default_client_config(client_config);

    let connection = endpoint
        .connect(harness.addr, "localhost")
        .unwrap()
        .await
        .unwrap();
    (endpoint, connection)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_edge_registers_and_serves_streams() {
    let harness = start_broker();
    let echo = spawn_echo_server().await;

    let (_endpoint, connection) = dial(&harness).await;
    let edge_id = authenticate(&connection, &Credentials::new("edge-ak", "edge-sk"))
        .await
        .unwrap();
    assert_eq!(edge_id, 42);

    // Edge side: dispatch every stream the broker opens
    let edge_conn = connection.clone();
    tokio::spawn(async move {
        while let Ok((send, recv)) = edge_conn.accept_bi().await {
            tokio::spawn(async move {
                let _ = EdgeStreamDispatcher::new()
                    .dispatch(QuicStream::new(send, recv), "broker")
                    .await;
            });
        }
    });

    let registry = harness.broker.registry();
    wait_until(|| registry.is_connected(42) && harness.board.is_online(42)).await;
    assert_eq!(registry.connected_edges(), vec![42]);

    let mut stream = registry.open_stream(42).await.unwrap();
    frame::write_message(&mut stream, &Destination::new(echo.to_string(), 3, 7))
        .await
        .unwrap();
    stream.write_all(b"through the tunnel").await.unwrap();

    let mut echoed = [0u8; 18];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the tunnel");

    connection.close(0u32.into(), b"done");
    wait_until(|| !harness.board.is_online(42)).await;
    assert!(!registry.is_connected(42));
}

#[tokio::test]
async fn test_bad_secret_is_rejected() {
    let harness = start_broker();

    let (_endpoint, connection) = dial(&harness).await;
    let result = authenticate(&connection, &Credentials::new("edge-ak", "wrong")).await;

    assert!(matches!(result, Err(HandshakeError::Rejected(_))));
    assert!(!harness.broker.registry().is_connected(42));
    assert!(!harness.board.is_online(42));
}

#[tokio::test]
async fn test_unknown_edge_is_offline() {
    let harness = start_broker();

    let result = harness.broker.registry().open_stream(7).await;
    assert!(matches!(result, Err(TunnelError::EdgeOffline(7))));
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let harness = start_broker();
    let credentials = Credentials::new("edge-ak", "edge-sk");

    let (_first_endpoint, first) = dial(&harness).await;
    authenticate(&first, &credentials).await.unwrap();

    let registry = harness.broker.registry();
    wait_until(|| registry.is_connected(42) && harness.board.is_online(42)).await;

    let (_second_endpoint, second) = dial(&harness).await;
    authenticate(&second, &credentials).await.unwrap();

    // The old connection is closed by the broker; the edge stays online
    tokio::time::timeout(Duration::from_secs(5), first.closed())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.board.is_online(42));
    assert!(registry.is_connected(42));

    second.close(0u32.into(), b"done");
    wait_until(|| !harness.board.is_online(42)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rapid_reconnects_keep_edge_online() {
    let harness = start_broker();
    let credentials = Credentials::new("edge-ak", "edge-sk");

    let mut connections = Vec::new();
    for _ in 0..8 {
        let (endpoint, connection) = dial(&harness).await;
        authenticate(&connection, &credentials).await.unwrap();
        connections.push((endpoint, connection));
    }

    // Exactly one connection survives; the broker closes the rest
    wait_until(|| {
        connections
            .iter()
            .filter(|(_, connection)| connection.close_reason().is_some())
            .count()
            == 7
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let registry = harness.broker.registry();
    assert!(registry.is_connected(42));
    assert!(harness.board.is_online(42));
    assert!(harness
        .board
        .board
        .work_token(42)
        .is_some_and(|token| !token.is_cancelled()));

    // Replaced connections never report the edge offline
    let transitions = harness.board.transitions();
    assert_eq!(transitions, vec![true; 8]);
}
