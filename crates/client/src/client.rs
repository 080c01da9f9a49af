use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use plexus_broker::Broker;
use plexus_core::{
    CallFn, Codec, Context, Error, Publication, PublishFn, Request, Response, Result, Stream,
    StreamFn, call_fn, chain, publish_fn, stream_fn, wire,
};
use plexus_pool::Pool;
use plexus_registry::Resolver;
use plexus_transport::Socket as _;
use rand::seq::SliceRandom;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{CallOptions, ClientOptions, ClientStream, PublishOptions, RetryPolicy};

/// Issues calls, streams and publishes.
///
/// Clones share the pool and the wrapper chains.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    resolver: Arc<dyn Resolver>,
    content_type: String,
    request_timeout: Duration,
    retry: RetryPolicy,
    call: CallFn,
    stream: StreamFn,
    publish: PublishFn,
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("resolver", &self.inner.resolver)
            .field("content_type", &self.inner.content_type)
            .field("request_timeout", &self.inner.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Builds a client. The wrapper chains are composed once, here.
    ///
    /// Must be called within a tokio runtime when a sweep interval is set.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let pool = options
            .pool
            .unwrap_or_else(|| Pool::new(options.transport.clone(), options.pool_options));
        if let Some(interval) = options.sweep_interval {
            pool.spawn_sweeper(interval);
        }

        let call = chain(terminal_call(pool.clone()), &options.call_wrappers);
        let stream = chain(terminal_stream(pool.clone()), &options.stream_wrappers);
        let publish = chain(terminal_publish(options.broker), &options.publish_wrappers);

        Self {
            inner: Arc::new(Inner {
                pool,
                resolver: options.resolver,
                content_type: options.content_type,
                request_timeout: options.request_timeout,
                retry: options.retry,
                call,
                stream,
                publish,
            }),
        }
    }

    /// The connection pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Calls `service.endpoint` with `req`, decoding the reply as `Rsp`.
    ///
    /// # Errors
    ///
    /// Codec errors, or any error of [`Client::call_raw`].
    pub async fn call<Req, Rsp>(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        req: &Req,
        options: CallOptions,
    ) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| self.inner.content_type.clone());
        let codec = Codec::for_content_type(&content_type)?;

        let request = Request::new(service, endpoint, content_type, codec.encode(req)?);
        let response = self.call_raw(ctx, request, options).await?;

        codec.decode(&response.body)
    }

    /// Runs an encoded request through the call chain, retrying per policy.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when nothing serves the service, otherwise the
    /// error of the last attempt.
    #[instrument(skip(self, ctx, request, options), fields(service = %request.service, endpoint = %request.endpoint))]
    pub async fn call_raw(
        &self,
        ctx: &Context,
        request: Request,
        options: CallOptions,
    ) -> Result<Response> {
        let retry = options.retry.unwrap_or_else(|| self.inner.retry.clone());
        let timeout = options
            .request_timeout
            .unwrap_or(self.inner.request_timeout);

        let mut attempt = 0;
        let mut delay = retry.initial_delay;

        loop {
            ctx.check()?;
            attempt += 1;

            let result = match self
                .address_for(&request.service, options.address.as_deref())
                .await
            {
                Ok(address) => {
                    let attempt_ctx = ctx.clone().with_timeout(timeout);
                    (self.inner.call)(attempt_ctx, address, request.clone()).await
                }
                Err(e @ Error::NotFound(_)) => return Err(e),
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if !retry.should_retry(attempt, &e) => return Err(e),
                Err(e) => {
                    debug!(
                        "Attempt {} of {} failed, retrying in {:?}: {}",
                        attempt, retry.max_attempts, delay, e
                    );
                }
            }

            ctx.run(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
            delay = retry.next_delay(delay);
        }
    }

    /// Opens a stream to `service.endpoint`.
    ///
    /// # Errors
    ///
    /// Resolution, dial or send errors.
    pub async fn stream(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        options: CallOptions,
    ) -> Result<Box<dyn Stream>> {
        let content_type = options
            .content_type
            .unwrap_or_else(|| self.inner.content_type.clone());
        let mut request = Request::new(service, endpoint, content_type, bytes::Bytes::new());
        request.stream = true;

        let address = self
            .address_for(service, options.address.as_deref())
            .await?;
        (self.inner.stream)(ctx.clone(), address, request).await
    }

    /// Encodes `msg` and publishes it to `topic` through the publish chain.
    ///
    /// # Errors
    ///
    /// Codec errors, [`Error::NotFound`] without a broker, or the broker's
    /// error.
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        topic: &str,
        msg: &T,
        options: PublishOptions,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let content_type = options
            .content_type
            .unwrap_or_else(|| self.inner.content_type.clone());
        let codec = Codec::for_content_type(&content_type)?;

        let publication = Publication::new(topic, content_type, codec.encode(msg)?);
        self.publish_raw(ctx, publication).await
    }

    /// Publishes an encoded publication through the publish chain.
    ///
    /// # Errors
    ///
    /// As [`Client::publish`].
    pub async fn publish_raw(&self, ctx: &Context, publication: Publication) -> Result<()> {
        ctx.check()?;
        (self.inner.publish)(ctx.clone(), publication).await
    }

    /// Closes the pool and stops its sweeper.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }

    async fn address_for(&self, service: &str, address: Option<&str>) -> Result<String> {
        if let Some(address) = address {
            return Ok(address.to_string());
        }

        let addresses = self
            .inner
            .resolver
            .resolve(service)
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        addresses
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {service}")))
    }
}

fn terminal_call(pool: Pool) -> CallFn {
    call_fn(move |ctx: Context, address: String, request: Request| {
        let pool = pool.clone();
        async move {
            loop {
                let mut socket = ctx
                    .run(async { pool.get(&address).await.map_err(Error::from) })
                    .await?;

                let request_id = Uuid::new_v4().to_string();
                let message = wire::encode_request(&request_id, ctx.metadata(), &request);

                let exchange = ctx
                    .run(async {
                        socket.send(message).await?;
                        Ok::<_, Error>(socket.recv().await?)
                    })
                    .await;

                return match exchange {
                    Ok(reply) if wire::request_id(&reply) == Some(request_id.as_str()) => {
                        pool.release(socket, true).await;
                        wire::decode_response(reply)
                    }
                    Ok(_) => {
                        warn!("Discarding socket to {}: response id mismatch", address);
                        pool.release(socket, false).await;
                        Err(Error::Closed("response does not match request".to_string()))
                    }
                    // The peer dropped an idle connection; each pass consumes one
                    // idle socket, so this ends on a fresh dial at the latest.
                    Err(Error::Closed(reason)) if socket.is_reused() => {
                        debug!("Idle socket to {} went stale ({}), redialing", address, reason);
                        pool.release(socket, false).await;
                        continue;
                    }
                    Err(e) => {
                        pool.release(socket, false).await;
                        Err(e)
                    }
                };
            }
        }
    })
}

fn terminal_stream(pool: Pool) -> StreamFn {
    stream_fn(move |ctx: Context, address: String, request: Request| {
        let pool = pool.clone();
        async move {
            let mut socket = ctx
                .run(async { pool.get(&address).await.map_err(Error::from) })
                .await?
                .into_inner();

            let request_id = Uuid::new_v4().to_string();
            let message = wire::encode_request(&request_id, ctx.metadata(), &request);

            if let Err(e) = ctx
                .run(async { socket.send(message).await.map_err(Error::from) })
                .await
            {
                let _ = socket.close().await;
                return Err(e);
            }

            debug!("Opened stream {} to {}", request_id, address);
            Ok(Box::new(ClientStream::new(ctx, request_id, request, socket)) as Box<dyn Stream>)
        }
    })
}

fn terminal_publish(broker: Option<Arc<dyn Broker>>) -> PublishFn {
    publish_fn(move |ctx: Context, mut publication: Publication| {
        let broker = broker.clone();
        async move {
            let Some(broker) = broker else {
                return Err(Error::NotFound("no broker configured".to_string()));
            };

            let mut header = ctx.metadata().clone();
            header.extend(&publication.header);
            publication.header = header;

            ctx.run(broker.publish(publication)).await
        }
    })
}
