//! In-memory transport implementation for testing
//!
//! This transport routes messages between sockets within the same process.
//! Listeners are registered in an address table shared by every clone of a
//! [`MemoryTransport`], so independent transports (and independent tests) never
//! see each other's listeners.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use plexus_transport::{DialOptions, Listener, Message, Result, Socket, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Capacity of each direction of a connection.
const CHANNEL_CAPACITY: usize = 100;

type Registry = Arc<DashMap<String, (Uuid, flume::Sender<MemorySocket>)>>;

/// Memory transport implementation
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    listeners: Registry,
    dialed: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Create a new memory transport with an empty address table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets successfully dialed through this transport.
    #[must_use]
    pub fn dial_count(&self) -> u64 {
        self.dialed.load(Ordering::SeqCst)
    }

    /// Whether a listener is currently bound on `address`.
    #[must_use]
    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.contains_key(address)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn dial(&self, address: &str, options: &DialOptions) -> Result<Box<dyn Socket>> {
        debug!("Dialing memory address {}", address);

        let incoming = self
            .listeners
            .get(address)
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| TransportError::connect(address, "no listener"))?;

        // Create a bidirectional connection pair
        let (client_to_server_tx, client_to_server_rx) = flume::bounded(CHANNEL_CAPACITY);
        let (server_to_client_tx, server_to_client_rx) = flume::bounded(CHANNEL_CAPACITY);

        let conn_id = Uuid::new_v4();
        let local = format!("memory-client-{conn_id}");

        let client = MemorySocket::new(
            conn_id,
            local.clone(),
            address.to_string(),
            client_to_server_tx,
            server_to_client_rx,
        );
        let server = MemorySocket::new(
            conn_id,
            address.to_string(),
            local,
            server_to_client_tx,
            client_to_server_rx,
        );

        tokio::time::timeout(options.timeout, incoming.send_async(server))
            .await
            .map_err(|_| TransportError::Timeout(format!("dial {address}")))?
            .map_err(|_| TransportError::connect(address, "listener closed"))?;

        self.dialed.fetch_add(1, Ordering::SeqCst);
        debug!("Memory connection {} established to {}", conn_id, address);

        Ok(Box::new(client))
    }

    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let address = if address.is_empty() || address.ends_with(":0") {
            format!("memory-{}", Uuid::new_v4())
        } else {
            address.to_string()
        };

        let (incoming_tx, incoming_rx) = flume::unbounded();
        let listener_id = Uuid::new_v4();

        match self.listeners.entry(address.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::bind(address, "address already in use"));
            }
            Entry::Vacant(slot) => {
                slot.insert((listener_id, incoming_tx));
            }
        }

        info!("Memory listener bound on {}", address);

        Ok(Box::new(MemoryListener {
            id: listener_id,
            address,
            incoming: incoming_rx,
            listeners: self.listeners.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

/// One end of an in-memory connection.
pub struct MemorySocket {
    id: Uuid,
    local: String,
    remote: String,
    sender: Option<flume::Sender<Message>>,
    receiver: Option<flume::Receiver<Message>>,
}

impl MemorySocket {
    const fn new(
        id: Uuid,
        local: String,
        remote: String,
        sender: flume::Sender<Message>,
        receiver: flume::Receiver<Message>,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            sender: Some(sender),
            receiver: Some(receiver),
        }
    }
}

impl Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl Socket for MemorySocket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn remote(&self) -> &str {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| !sender.is_disconnected())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(TransportError::Closed)?;

        sender
            .send_async(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Message> {
        let receiver = self.receiver.as_ref().ok_or(TransportError::Closed)?;

        receiver
            .recv_async()
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        if self.sender.take().is_some() {
            debug!("Closing memory socket {}", self.id);
        }
        self.receiver.take();
        Ok(())
    }
}

/// Memory listener implementation
struct MemoryListener {
    id: Uuid,
    address: String,
    incoming: flume::Receiver<MemorySocket>,
    listeners: Registry,
    closed: CancellationToken,
}

impl MemoryListener {
    fn unregister(&self) {
        self.listeners
            .remove_if(&self.address, |_, (id, _)| *id == self.id);
    }
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("address", &self.address)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn addr(&self) -> String {
        self.address.clone()
    }

    async fn accept(&self) -> Result<Box<dyn Socket>> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            socket = self.incoming.recv_async() => {
                let socket = socket.map_err(|_| TransportError::Closed)?;
                debug!("Memory listener {} accepted {}", self.address, socket.id);
                Ok(Box::new(socket) as Box<dyn Socket>)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            debug!("Closing memory listener {}", self.address);
            self.closed.cancel();
            self.unregister();
        }
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_without_listener_fails() {
        let transport = MemoryTransport::new();

        let result = transport.dial("nowhere", &DialOptions::default()).await;

        assert!(matches!(result, Err(TransportError::Connect { .. })));
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_double_bind_fails() {
        let transport = MemoryTransport::new();
        let _listener = transport.listen("svc").await.unwrap();

        let result = transport.listen("svc").await;

        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_close_releases_address() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("svc").await.unwrap();

        listener.close().await.unwrap();

        assert!(!transport.is_listening("svc"));
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::Closed)
        ));
        let _again = transport.listen("svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_address() {
        let transport = MemoryTransport::new();
        let listener = transport.listen(":0").await.unwrap();

        assert!(listener.addr().starts_with("memory-"));
        assert!(transport.is_listening(&listener.addr()));
    }

    #[tokio::test]
    async fn test_transports_are_isolated() {
        let first = MemoryTransport::new();
        let second = MemoryTransport::new();
        let _listener = first.listen("svc").await.unwrap();

        assert!(second.dial("svc", &DialOptions::default()).await.is_err());
        assert!(first.clone().is_listening("svc"));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("svc").await.unwrap();

        let mut client = transport
            .dial("svc", &DialOptions::default())
            .await
            .unwrap();
        let mut server = listener.accept().await.unwrap();

        assert!(client.is_open());
        server.close().await.unwrap();
        server.close().await.unwrap();

        assert!(matches!(client.recv().await, Err(TransportError::Closed)));
        assert!(!client.is_open());
        assert!(matches!(
            server.send(Message::new("late")).await,
            Err(TransportError::Closed)
        ));
    }
}
