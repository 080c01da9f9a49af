//! Envelopes exchanged between clients, servers and brokers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Metadata, Result};

/// An encoded request addressed to one endpoint of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    /// Target service name.
    pub service: String,
    /// Target endpoint name.
    pub endpoint: String,
    /// Encoding of `body`.
    pub content_type: String,
    /// Encoded payload.
    pub body: Bytes,
    /// Whether the request opens a stream.
    pub stream: bool,
}

impl Request {
    /// Creates a unary request.
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: content_type.into(),
            body: body.into(),
            stream: false,
        }
    }
}

/// An encoded response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// Response header entries, other than the reserved wire keys.
    pub header: BTreeMap<String, String>,
    /// Encoded payload.
    pub body: Bytes,
}

impl Response {
    /// Creates a response with an empty header.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: BTreeMap::new(),
            body: body.into(),
        }
    }
}

/// A message published to a topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Publication {
    /// Topic name.
    pub topic: String,
    /// Encoding of `body`.
    pub content_type: String,
    /// Propagated metadata.
    pub header: Metadata,
    /// Encoded payload.
    pub body: Bytes,
}

impl Publication {
    /// Creates a publication with an empty header.
    pub fn new(
        topic: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            content_type: content_type.into(),
            header: Metadata::new(),
            body: body.into(),
        }
    }
}

/// A long-lived bidirectional exchange tied to one socket.
#[async_trait]
pub trait Stream: Send {
    /// The request that opened the stream.
    fn request(&self) -> &Request;

    /// Sends one encoded message.
    async fn send(&mut self, body: Bytes) -> Result<()>;

    /// Receives the next message; `None` once the peer has ended the stream.
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Ends the stream and releases its socket.
    async fn close(&mut self) -> Result<()>;
}

/// What a handler receives: the request, plus the stream for streaming
/// endpoints.
pub struct Incoming {
    /// The decoded envelope.
    pub request: Request,
    /// Present when the request opened a stream.
    pub stream: Option<Box<dyn Stream>>,
}

impl Incoming {
    /// A unary invocation.
    #[must_use]
    pub const fn unary(request: Request) -> Self {
        Self {
            request,
            stream: None,
        }
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("request", &self.request)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}
