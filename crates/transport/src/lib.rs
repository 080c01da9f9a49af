//! Transport abstraction for plexus.
//!
//! A [`Transport`] is a factory for [`Socket`]s: it dials outbound connections
//! and binds [`Listener`]s that yield inbound ones. Concrete protocols (memory,
//! TCP, ...) live in separate crates; the pool, client and server only ever see
//! these traits.
//!
//! Sockets carry whole [`Message`]s. Send and receive take `&mut self`, so a
//! socket has at most one operation in flight per direction and a single owner
//! at a time.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::TransportError;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A framed message exchanged over a socket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Header key/value pairs.
    pub header: BTreeMap<String, String>,
    /// Opaque body, encoded by the codec named in the header.
    pub body: Bytes,
}

impl Message {
    /// Creates a message with an empty header.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header entry.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Looks up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }
}

/// Options applied when dialing.
#[derive(Clone, Debug)]
pub struct DialOptions {
    /// How long to wait for the connection to be established.
    pub timeout: Duration,
    /// Whether the socket will carry a long-lived stream.
    pub stream: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5), // 5 seconds
            stream: false,
        }
    }
}

/// One bidirectional, message-framed connection.
///
/// `close` is idempotent; every send or receive after it fails with
/// [`TransportError::Closed`].
#[async_trait]
pub trait Socket: Debug + Send + Sync {
    /// Unique id of this connection.
    fn id(&self) -> Uuid;

    /// Local address.
    fn local(&self) -> &str;

    /// Remote address.
    fn remote(&self) -> &str;

    /// Whether the socket still looks usable.
    fn is_open(&self) -> bool;

    /// Sends one message.
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Receives the next message.
    async fn recv(&mut self) -> Result<Message>;

    /// Closes the socket.
    async fn close(&mut self) -> Result<()>;
}

/// A bound listener yielding inbound sockets.
#[async_trait]
pub trait Listener: Debug + Send + Sync {
    /// The bound address.
    fn addr(&self) -> String;

    /// Waits for the next inbound socket. Fails with
    /// [`TransportError::Closed`] once the listener has been closed.
    async fn accept(&self) -> Result<Box<dyn Socket>>;

    /// Stops accepting. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Factory for sockets of one protocol.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Short protocol name used in logs.
    fn name(&self) -> &'static str;

    /// Opens an outbound socket to `address`.
    async fn dial(&self, address: &str, options: &DialOptions) -> Result<Box<dyn Socket>>;

    /// Binds a listener on `address`.
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_headers() {
        let message = Message::new("body")
            .with_header("x-endpoint", "echo")
            .with_header("content-type", "application/cbor");

        assert_eq!(message.header("x-endpoint"), Some("echo"));
        assert_eq!(message.header("missing"), None);
        assert_eq!(message.body, Bytes::from_static(b"body"));
    }

    #[test]
    fn test_io_errors_map_to_closed() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(TransportError::from(eof), TransportError::Closed));

        let other = std::io::Error::other("boom");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }
}
