//! Pool behaviour against the in-memory transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use plexus_pool::{Pool, PoolOptions};
use plexus_transport::{Message, Socket as _, Transport};
use plexus_transport_memory::MemoryTransport;
use tokio::task::JoinHandle;

/// Binds `address` and echoes every message on every accepted socket.
async fn echo_server(transport: &MemoryTransport, address: &str) -> JoinHandle<()> {
    let listener = transport.listen(address).await.expect("Failed to listen");

    tokio::spawn(async move {
        while let Ok(mut socket) = listener.accept().await {
            tokio::spawn(async move {
                while let Ok(message) = socket.recv().await {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    })
}

fn pool_with(transport: &MemoryTransport, options: PoolOptions) -> Pool {
    Pool::new(Arc::new(transport.clone()), options)
}

#[tokio::test]
async fn test_released_socket_is_reused() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(&transport, PoolOptions::default());

    let mut socket = pool.get("svc").await.unwrap();
    assert!(!socket.is_reused());
    socket.send(Message::new("ping")).await.unwrap();
    assert_eq!(socket.recv().await.unwrap().body, "ping");
    let first_id = socket.id();
    pool.release(socket, true).await;

    let socket = pool.get("svc").await.unwrap();

    assert!(socket.is_reused());
    assert_eq!(socket.id(), first_id);
    assert_eq!(transport.dial_count(), 1);
}

#[tokio::test]
async fn test_most_recently_released_comes_back_first() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(&transport, PoolOptions::default());

    let a = pool.get("svc").await.unwrap();
    let b = pool.get("svc").await.unwrap();
    let b_id = b.id();
    pool.release(a, true).await;
    pool.release(b, true).await;

    let next = pool.get("svc").await.unwrap();

    assert_eq!(next.id(), b_id);
    assert_eq!(transport.dial_count(), 2);
}

#[tokio::test]
async fn test_idle_set_is_bounded() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(
        &transport,
        PoolOptions {
            size: 2,
            ..PoolOptions::default()
        },
    );

    let mut sockets = Vec::new();
    for _ in 0..3 {
        sockets.push(pool.get("svc").await.unwrap());
    }
    for socket in sockets {
        pool.release(socket, true).await;
    }

    assert_eq!(pool.idle_count("svc"), 2);
}

#[tokio::test]
async fn test_non_reusable_release_closes() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(&transport, PoolOptions::default());

    let socket = pool.get("svc").await.unwrap();
    pool.release(socket, false).await;

    assert_eq!(pool.idle_count("svc"), 0);
    let again = pool.get("svc").await.unwrap();
    assert!(!again.is_reused());
    assert_eq!(transport.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_socket_is_not_handed_out() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(
        &transport,
        PoolOptions {
            ttl: Duration::from_secs(1),
            ..PoolOptions::default()
        },
    );

    let socket = pool.get("svc").await.unwrap();
    let first_id = socket.id();
    pool.release(socket, true).await;

    tokio::time::advance(Duration::from_secs(1)).await;
    let socket = pool.get("svc").await.unwrap();

    assert_ne!(socket.id(), first_id);
    assert_eq!(transport.dial_count(), 2);
    assert_eq!(pool.idle_count("svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_closes_expired_sockets() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(
        &transport,
        PoolOptions {
            ttl: Duration::from_secs(1),
            ..PoolOptions::default()
        },
    );

    let a = pool.get("svc").await.unwrap();
    let b = pool.get("svc").await.unwrap();
    pool.release(a, true).await;
    tokio::time::advance(Duration::from_secs(2)).await;
    pool.release(b, true).await;

    assert_eq!(pool.sweep().await, 1);
    assert_eq!(pool.idle_count("svc"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweeper() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(
        &transport,
        PoolOptions {
            ttl: Duration::from_secs(1),
            ..PoolOptions::default()
        },
    );
    pool.spawn_sweeper(Duration::from_millis(500));

    let socket = pool.get("svc").await.unwrap();
    pool.release(socket, true).await;
    assert_eq!(pool.idle_count("svc"), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pool.idle_count("svc"), 0);
    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_checkouts_are_exclusive() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(
        &transport,
        PoolOptions {
            size: 4,
            ..PoolOptions::default()
        },
    );

    // Warm the idle set so the concurrent gets race over shared entries.
    let mut warm = Vec::new();
    for _ in 0..4 {
        warm.push(pool.get("svc").await.unwrap());
    }
    for socket in warm {
        pool.release(socket, true).await;
    }

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.get("svc").await.unwrap() }));
    }

    let mut held = Vec::new();
    for task in tasks {
        held.push(task.await.unwrap());
    }
    let ids: HashSet<_> = held.iter().map(|socket| socket.id()).collect();

    assert_eq!(ids.len(), held.len());
}

#[tokio::test]
async fn test_peer_closed_idle_socket_is_skipped() {
    let transport = MemoryTransport::new();
    let listener = transport.listen("svc").await.unwrap();
    let pool = pool_with(&transport, PoolOptions::default());

    let socket = pool.get("svc").await.unwrap();
    let first_id = socket.id();
    let mut server_side = listener.accept().await.unwrap();
    pool.release(socket, true).await;
    server_side.close().await.unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let socket = pool.get("svc").await.unwrap();

    assert_ne!(socket.id(), first_id);
    let _server_side = accept.await.unwrap();
}

#[tokio::test]
async fn test_close_drains_idle_sockets() {
    let transport = MemoryTransport::new();
    let _server = echo_server(&transport, "svc").await;
    let pool = pool_with(&transport, PoolOptions::default());

    let socket = pool.get("svc").await.unwrap();
    let held = pool.get("svc").await.unwrap();
    pool.release(socket, true).await;

    pool.close().await;
    assert_eq!(pool.idle_count("svc"), 0);

    // A socket checked out before close is closed on release.
    pool.release(held, true).await;
    assert_eq!(pool.idle_count("svc"), 0);
}
