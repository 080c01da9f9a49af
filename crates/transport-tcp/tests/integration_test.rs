//! Integration tests for TCP transport

use std::time::Duration;

use bytes::Bytes;
use plexus_transport::{DialOptions, Message, Transport, TransportError};
use plexus_transport_tcp::TcpTransport;
use tokio::time::timeout;
use tracing::info;

#[tokio::test]
async fn test_tcp_transport_basic() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = TcpTransport::default();
    let listener = transport
        .listen("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let address = listener.addr();
    info!("Listening on {address}");

    let server_task = tokio::spawn(async move {
        let mut socket = listener.accept().await.expect("Failed to accept");
        while let Ok(message) = socket.recv().await {
            let reply = Message::new(message.body.clone())
                .with_header("x-echo", message.header("x-seq").unwrap_or_default());
            socket.send(reply).await.expect("Failed to reply");
        }
    });

    let mut client = transport
        .dial(&address, &DialOptions::default())
        .await
        .expect("Failed to connect");
    assert!(client.is_open());
    assert_eq!(client.remote(), address);

    for seq in 0..5 {
        let body = Bytes::from(format!("frame {seq}"));
        client
            .send(Message::new(body.clone()).with_header("x-seq", seq.to_string()))
            .await
            .expect("Failed to send");

        let reply = timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("Timeout")
            .expect("Failed to receive");

        assert_eq!(reply.body, body);
        assert_eq!(reply.header("x-echo"), Some(seq.to_string().as_str()));
    }

    client.close().await.expect("Failed to close");
    assert!(matches!(
        client.send(Message::new("late")).await,
        Err(TransportError::Closed)
    ));

    timeout(Duration::from_secs(5), server_task)
        .await
        .expect("Server did not observe close")
        .expect("Server task panicked");
}

#[tokio::test]
async fn test_peer_close_surfaces_as_closed() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = TcpTransport::default();
    let listener = transport.listen("127.0.0.1:0").await.unwrap();
    let address = listener.addr();

    let server_task = tokio::spawn(async move {
        let mut socket = listener.accept().await.unwrap();
        socket.close().await.unwrap();
    });

    let mut client = transport
        .dial(&address, &DialOptions::default())
        .await
        .unwrap();
    server_task.await.unwrap();

    let result = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("Timeout");

    assert!(matches!(result, Err(TransportError::Closed)));
    assert!(!client.is_open());
}
