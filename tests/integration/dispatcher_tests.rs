//! Edge dispatcher against real local services

use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use edgeport_server::edge::DispatchError;
use edgeport_server::protocol::{frame, Destination};
use edgeport_server::EdgeStreamDispatcher;

use crate::common::spawn_echo_server;

#[tokio::test]
async fn test_stream_reaches_local_service() {
    let echo = spawn_echo_server().await;
    let (mut tunnel, edge_side) = tokio::io::duplex(16 * 1024);

    let dispatch = tokio::spawn(async move {
        EdgeStreamDispatcher::new()
            .dispatch(edge_side, "test tunnel")
            .await
    });

    // Frame and payload in one write
    let mut bytes = frame::encode(&Destination::new(echo.to_string(), 1, 5))
        .unwrap()
        .to_vec();
    bytes.extend_from_slice(b"hello edge");
    tunnel.write_all(&bytes).await.unwrap();

    let mut echoed = [0u8; 10];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello edge");

    drop(tunnel);
    let stats = dispatch.await.unwrap().unwrap();
    assert_eq!(stats.left_to_right, 10);
    assert_eq!(stats.right_to_left, 10);
}

#[tokio::test]
async fn test_unreachable_service_closes_stream() {
    // Reserve a port, then free it so nothing listens there
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (mut tunnel, edge_side) = tokio::io::duplex(16 * 1024);
    frame::write_message(&mut tunnel, &Destination::new(addr.to_string(), 1, 5))
        .await
        .unwrap();

    let result = EdgeStreamDispatcher::new()
        .dispatch(edge_side, "test tunnel")
        .await;
    assert!(matches!(result, Err(DispatchError::Dial { .. })));

    // Nothing is written back
    let mut rest = Vec::new();
    tunnel.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_garbage_frame_is_dropped() {
    let (mut tunnel, edge_side) = tokio::io::duplex(1024);
    tunnel.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();

    let result = EdgeStreamDispatcher::new()
        .dispatch(edge_side, "test tunnel")
        .await;
    assert!(matches!(result, Err(DispatchError::Frame(_))));
}
