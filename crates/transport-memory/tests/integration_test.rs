//! Integration tests for memory transport

use std::time::Duration;

use bytes::Bytes;
use plexus_transport::{DialOptions, Message, Transport};
use plexus_transport_memory::MemoryTransport;
use tokio::time::timeout;
use tracing::info;

#[tokio::test]
async fn test_memory_echo_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let listener = transport
        .listen("echo")
        .await
        .expect("Failed to create listener");

    // Start echo server
    let server_task = tokio::spawn(async move {
        while let Ok(mut socket) = listener.accept().await {
            info!("Server accepted connection {}", socket.id());

            tokio::spawn(async move {
                while let Ok(message) = socket.recv().await {
                    if let Err(e) = socket.send(message).await {
                        info!("Server send error: {}", e);
                        break;
                    }
                }
            });
        }
    });

    let mut client = transport
        .dial("echo", &DialOptions::default())
        .await
        .expect("Failed to connect");

    let test_messages = vec![
        Bytes::from("Hello, Memory!"),
        Bytes::from("Test message 2"),
        Bytes::from("🦀 Rust is awesome!"),
    ];

    for body in test_messages {
        let message = Message::new(body.clone()).with_header("x-seq", "1");
        client.send(message.clone()).await.expect("Failed to send");

        let response = timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("Timeout")
            .expect("Failed to receive");

        assert_eq!(message, response);
    }

    client.close().await.expect("Failed to close client");
    server_task.abort();
}

#[tokio::test]
async fn test_multiple_clients() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let listener = transport
        .listen("multi")
        .await
        .expect("Failed to create listener");

    let server_task = tokio::spawn(async move {
        let mut connection_count = 0;

        while let Ok(mut socket) = listener.accept().await {
            connection_count += 1;
            let conn_id = connection_count;

            tokio::spawn(async move {
                while let Ok(message) = socket.recv().await {
                    let mut body = message.body.to_vec();
                    body.extend_from_slice(format!(" [from conn #{conn_id}]").as_bytes());
                    if socket.send(Message::new(body)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let mut clients = vec![];
    for i in 0..3 {
        let client = transport
            .dial("multi", &DialOptions::default())
            .await
            .expect("Failed to connect");
        clients.push((i, client));
    }

    for (id, client) in &mut clients {
        let body = Bytes::from(format!("Hello from client {id}"));
        client
            .send(Message::new(body.clone()))
            .await
            .expect("Failed to send");

        let response = timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("Timeout")
            .expect("Failed to receive");

        assert!(response.body.starts_with(&body));
    }

    assert_eq!(transport.dial_count(), 3);

    for (_, mut client) in clients {
        let _ = client.close().await;
    }
    server_task.abort();
}
