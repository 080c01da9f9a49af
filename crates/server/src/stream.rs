use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use plexus_core::{Error, Request, Result, Stream, wire};
use plexus_transport::Socket;
use tokio::sync::Mutex;

/// Server side of a stream, handed to stream handlers.
///
/// The server keeps a handle on the socket and sends the end-of-stream
/// message itself once the handler returns.
#[derive(Debug)]
pub struct ServerStream {
    request_id: String,
    request: Request,
    socket: Arc<Mutex<Box<dyn Socket>>>,
    peer_finished: bool,
    closed: bool,
}

impl ServerStream {
    pub(crate) const fn new(
        request_id: String,
        request: Request,
        socket: Arc<Mutex<Box<dyn Socket>>>,
    ) -> Self {
        Self {
            request_id,
            request,
            socket,
            peer_finished: false,
            closed: false,
        }
    }
}

#[async_trait]
impl Stream for ServerStream {
    fn request(&self) -> &Request {
        &self.request
    }

    async fn send(&mut self, body: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("stream closed".to_string()));
        }
        let message = wire::stream_message(&self.request_id, body);
        self.socket.lock().await.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.closed || self.peer_finished {
            return Ok(None);
        }

        let message = self.socket.lock().await.recv().await?;
        if wire::is_end_of_stream(&message) {
            self.peer_finished = true;
            return Ok(None);
        }
        Ok(Some(message.body))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
