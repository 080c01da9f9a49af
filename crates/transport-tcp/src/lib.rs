//! TCP transport implementation
//!
//! Each [`Message`] travels as a single frame: a 4-byte big-endian length
//! prefix followed by the CBOR encoding of the message.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use plexus_transport::{DialOptions, Listener, Message, Result, Socket, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for the TCP transport
#[derive(Clone, Debug)]
pub struct TcpOptions {
    /// Largest frame accepted or sent, in bytes
    pub max_frame_size: usize,
    /// Whether to set `TCP_NODELAY` on new sockets
    pub nodelay: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024, // 10MB
            nodelay: true,
        }
    }
}

/// TCP transport
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    options: TcpOptions,
}

impl TcpTransport {
    /// Create a new TCP transport
    #[must_use]
    pub const fn new(options: TcpOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, address: &str, options: &DialOptions) -> Result<Box<dyn Socket>> {
        debug!("Dialing tcp {}", address);

        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(format!("dial {address}")))?
            .map_err(|e| TransportError::connect(address, e))?;

        let socket = TcpSocket::new(stream, &self.options)?;
        debug!("TCP connection {} established to {}", socket.id, address);

        Ok(Box::new(socket))
    }

    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::bind(address, e))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::bind(address, e))?
            .to_string();

        info!("TCP listener bound on {}", bound);

        Ok(Box::new(TcpSocketListener {
            address: bound,
            listener: RwLock::new(Some(listener)),
            closed: CancellationToken::new(),
            options: self.options.clone(),
        }))
    }
}

/// A framed TCP connection.
pub struct TcpSocket {
    id: Uuid,
    local: String,
    remote: String,
    stream: Option<TcpStream>,
    max_frame_size: usize,
}

impl TcpSocket {
    fn new(stream: TcpStream, options: &TcpOptions) -> Result<Self> {
        stream.set_nodelay(options.nodelay)?;
        let local = stream.local_addr()?.to_string();
        let remote = stream.peer_addr()?.to_string();

        Ok(Self {
            id: Uuid::new_v4(),
            local,
            remote,
            stream: Some(stream),
            max_frame_size: options.max_frame_size,
        })
    }

    /// Read one length-prefixed frame
    async fn read_frame(stream: &mut TcpStream, max_frame_size: usize) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame_size {
            return Err(TransportError::invalid_message(format!(
                "frame of {len} bytes exceeds limit of {max_frame_size}"
            )));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        Ok(Bytes::from(data))
    }

    /// Write one length-prefixed frame
    async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| TransportError::invalid_message("frame too large"))?;

        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }
}

impl Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[async_trait]
impl Socket for TcpSocket {
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
        self.stream.is_some()
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let mut data = Vec::new();
        ciborium::ser::into_writer(&message, &mut data)
            .map_err(TransportError::invalid_message)?;
        if data.len() > self.max_frame_size {
            return Err(TransportError::invalid_message(format!(
                "frame of {} bytes exceeds limit of {}",
                data.len(),
                self.max_frame_size
            )));
        }

        let result = Self::write_frame(stream, &data).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn recv(&mut self) -> Result<Message> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let frame = match Self::read_frame(stream, self.max_frame_size).await {
            Ok(frame) => frame,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        ciborium::de::from_reader(frame.as_ref()).map_err(TransportError::invalid_message)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing tcp socket {}", self.id);
            // Peer may already be gone.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

struct TcpSocketListener {
    address: String,
    listener: RwLock<Option<TcpListener>>,
    closed: CancellationToken,
    options: TcpOptions,
}

impl Debug for TcpSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocketListener")
            .field("address", &self.address)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Listener for TcpSocketListener {
    fn addr(&self) -> String {
        self.address.clone()
    }

    async fn accept(&self) -> Result<Box<dyn Socket>> {
        let guard = self.listener.read().await;
        let listener = guard.as_ref().ok_or(TransportError::Closed)?;

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!("TCP listener {} accepted {}", self.address, peer);
                Ok(Box::new(TcpSocket::new(stream, &self.options)?) as Box<dyn Socket>)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        // Pending accepts observe the token and release their read guard.
        if self.listener.write().await.take().is_some() {
            debug!("Closed tcp listener {}", self.address);
        }
        Ok(())
    }
}
