use async_trait::async_trait;
use bytes::Bytes;
use plexus_core::{Context, Error, Request, Result, Stream, wire};
use plexus_transport::Socket;
use tracing::{debug, trace};

/// Client side of a stream.
///
/// Owns its socket for its whole life; the socket is closed, never pooled,
/// when the stream ends.
#[derive(Debug)]
pub struct ClientStream {
    ctx: Context,
    request_id: String,
    request: Request,
    socket: Option<Box<dyn Socket>>,
    finished: bool,
}

impl ClientStream {
    pub(crate) const fn new(
        ctx: Context,
        request_id: String,
        request: Request,
        socket: Box<dyn Socket>,
    ) -> Self {
        Self {
            ctx,
            request_id,
            request,
            socket: Some(socket),
            finished: false,
        }
    }

    fn socket(&mut self) -> Result<&mut Box<dyn Socket>> {
        self.socket
            .as_mut()
            .ok_or_else(|| Error::Closed("stream closed".to_string()))
    }
}

#[async_trait]
impl Stream for ClientStream {
    fn request(&self) -> &Request {
        &self.request
    }

    async fn send(&mut self, body: Bytes) -> Result<()> {
        let message = wire::stream_message(&self.request_id, body);
        let ctx = self.ctx.clone();
        let socket = self.socket()?;

        ctx.run(async { socket.send(message).await.map_err(Error::from) })
            .await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        let ctx = self.ctx.clone();
        let socket = self.socket()?;

        let message = ctx
            .run(async { socket.recv().await.map_err(Error::from) })
            .await?;

        if wire::is_end_of_stream(&message) {
            trace!("Stream {} ended by server", self.request_id);
            self.finished = true;
            return wire::error_of(&message).map_or(Ok(None), Err);
        }
        Ok(Some(message.body))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };

        if !self.finished {
            // The server may already have hung up.
            let _ = socket
                .send(wire::end_of_stream(&self.request_id, None))
                .await;
        }

        debug!("Closing stream {}", self.request_id);
        socket.close().await.map_err(Error::from)
    }
}
