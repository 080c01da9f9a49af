use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use plexus_broker::SubscriptionId;
use plexus_core::{
    Codec, Context, Error, HandlerFn, Incoming, Publication, Request, Response, Result, Stream,
    SubscriberFn, chain, handler_fn, subscriber_fn, wire,
};
use plexus_registry::Registration;
use plexus_store::{Record, WriteOptions};
use plexus_transport::{Listener, Socket, TransportError};
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{RequestId, ServerOptions, ServerStream};

// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle state of a [`Server`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Built, not started.
    Created,
    /// Bound and serving, not (yet) registered.
    Listening,
    /// Serving and registered.
    Registered,
    /// Stopping: no new work, waiting for in-flight invocations.
    Draining,
    /// Fully stopped.
    Stopped,
}

/// Serves handlers and subscribers over a transport listener.
///
/// Handlers and subscribers are registered before [`Server::start`], which
/// binds, attaches subscribers to the broker and makes the first
/// registration attempt. [`Server::stop`] drains.
pub struct Server {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Endpoint {
    handler: HandlerFn,
    stream: bool,
}

struct Inner {
    options: ServerOptions,
    handlers: DashMap<String, Endpoint>,
    subscribers: Mutex<Vec<(String, SubscriberFn)>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    state: Mutex<State>,
    address: Mutex<Option<String>>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    // Ends the accept and registration loops and idle connections.
    stop: CancellationToken,
    // Fails invocations still running when the drain timeout passes.
    force: CancellationToken,
    inflight: TaskTracker,
    connections: TaskTracker,
}

impl Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.options.name)
            .field("id", &self.inner.options.id)
            .field("state", &*self.inner.state.lock())
            .field("address", &*self.inner.address.lock())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server in the [`State::Created`] state.
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        let inflight = options.wait.clone().unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                options,
                handlers: DashMap::new(),
                subscribers: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                state: Mutex::new(State::Created),
                address: Mutex::new(None),
                listener: Mutex::new(None),
                loops: Mutex::new(Vec::new()),
                stop: CancellationToken::new(),
                force: CancellationToken::new(),
                inflight,
                connections: TaskTracker::new(),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    /// The bound address, once started.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.inner.address.lock().clone()
    }

    /// The options the server was built from.
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Registers a typed handler for `endpoint`.
    ///
    /// The request is decoded and the response encoded with the codec of the
    /// request's content type.
    ///
    /// # Errors
    ///
    /// Fails once the server has started.
    pub fn handle<Req, Rsp, F, Fut>(&self, endpoint: &str, f: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handle_raw(
            endpoint,
            handler_fn(move |ctx: Context, incoming: Incoming| {
                let f = f.clone();
                async move {
                    let codec = Codec::for_content_type(&incoming.request.content_type)?;
                    let req: Req = codec
                        .decode(&incoming.request.body)
                        .map_err(|e| Error::BadRequest(e.to_string()))?;
                    let rsp = f(ctx, req).await?;
                    Ok::<_, Error>(Response::new(codec.encode(&rsp)?))
                }
            }),
        )
    }

    /// Registers a unary handler on encoded requests.
    ///
    /// # Errors
    ///
    /// Fails once the server has started.
    pub fn handle_raw(&self, endpoint: &str, handler: HandlerFn) -> Result<()> {
        self.register_handler(endpoint, handler, false)
    }

    /// Registers a stream handler for `endpoint`.
    ///
    /// The server ends the stream once `f` returns, carrying its error if any.
    ///
    /// # Errors
    ///
    /// Fails once the server has started.
    pub fn handle_stream<F, Fut>(&self, endpoint: &str, f: F) -> Result<()>
    where
        F: Fn(Context, Box<dyn Stream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_handler(
            endpoint,
            handler_fn(move |ctx: Context, incoming: Incoming| {
                let f = f.clone();
                async move {
                    let endpoint = incoming.request.endpoint.clone();
                    let stream = incoming
                        .stream
                        .ok_or_else(|| Error::BadRequest(format!("{endpoint} is a stream endpoint")))?;
                    f(ctx, stream).await?;
                    Ok::<_, Error>(Response::default())
                }
            }),
            true,
        )
    }

    /// Registers a typed subscriber for `topic`.
    ///
    /// # Errors
    ///
    /// Fails once the server has started.
    pub fn subscribe<T, F, Fut>(&self, topic: &str, f: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.subscribe_raw(
            topic,
            subscriber_fn(move |ctx: Context, publication: Publication| {
                let f = f.clone();
                async move {
                    let codec = Codec::for_content_type(&publication.content_type)?;
                    let msg: T = codec.decode(&publication.body)?;
                    f(ctx, msg).await
                }
            }),
        )
    }

    /// Registers a subscriber on encoded publications.
    ///
    /// # Errors
    ///
    /// Fails once the server has started.
    pub fn subscribe_raw(&self, topic: &str, subscriber: SubscriberFn) -> Result<()> {
        self.ensure_created()?;

        let subscriber = chain(subscriber, &self.inner.options.subscriber_wrappers);
        self.inner
            .subscribers
            .lock()
            .push((topic.to_string(), subscriber));
        Ok(())
    }

    /// Binds the listener, attaches subscribers, starts the accept and
    /// registration loops, and makes the first registration attempt.
    ///
    /// A failed registration is not fatal.
    ///
    /// # Errors
    ///
    /// [`Error::BadRequest`] if a registry is set with a zero refresh
    /// interval, [`Error::Bind`] if the listener cannot be bound, or a broker
    /// error while attaching subscribers.
    #[instrument(skip(self), fields(name = %self.inner.options.name))]
    pub async fn start(&self) -> Result<()> {
        self.ensure_created()?;
        let inner = &self.inner;

        if inner.options.registry.is_some() && inner.options.register_interval.is_zero() {
            return Err(Error::BadRequest(format!(
                "server {}: register interval must be greater than zero",
                inner.options.name
            )));
        }

        let listener: Arc<dyn Listener> = inner
            .options
            .transport
            .listen(&inner.options.address)
            .await
            .map_err(|e| Error::Bind(e.to_string()))?
            .into();
        let address = listener.addr();

        *inner.address.lock() = Some(address.clone());
        *inner.listener.lock() = Some(listener.clone());
        inner.set_state(State::Listening);
        info!("Server {} listening on {}", inner.options.name, address);

        if let Err(e) = inner.attach_subscribers().await {
            inner.detach_subscribers().await;
            let _ = listener.close().await;
            inner.set_state(State::Stopped);
            return Err(e);
        }

        let accept = tokio::spawn(inner.clone().accept_loop(listener));
        inner.loops.lock().push(accept);

        if inner.options.registry.is_some() {
            inner.register_once().await;
            let refresh = tokio::spawn(inner.clone().register_loop());
            inner.loops.lock().push(refresh);
        } else {
            inner.set_state(State::Registered);
        }

        Ok(())
    }

    /// Drains and stops the server.
    ///
    /// Stops accepting, detaches subscribers, closes idle connections and
    /// waits up to the drain timeout for in-flight invocations. Whatever is
    /// still running then fails with [`Error::ServerStopping`]. Finally
    /// deregisters (best effort) and closes the listener and the pool.
    ///
    /// # Errors
    ///
    /// Currently infallible; stopping twice is a no-op.
    #[instrument(skip(self), fields(name = %self.inner.options.name))]
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            match *state {
                State::Created => {
                    *state = State::Stopped;
                    return Ok(());
                }
                State::Draining | State::Stopped => return Ok(()),
                State::Listening | State::Registered => *state = State::Draining,
            }
        }
        info!("Server {} draining", inner.options.name);

        inner.stop.cancel();
        let loops = std::mem::take(&mut *inner.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("Server loop ended abnormally: {}", e);
            }
        }

        inner.detach_subscribers().await;

        inner.inflight.close();
        inner.connections.close();
        let drain_timeout = inner.options.drain_timeout;
        if timeout(drain_timeout, inner.inflight.wait()).await.is_err() {
            warn!(
                "Drain timeout of {:?} exceeded with {} invocations in flight",
                drain_timeout,
                inner.inflight.len()
            );
        }
        inner.force.cancel();
        inner.connections.wait().await;

        inner.deregister().await;

        let listener = inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.close().await {
                warn!("Failed to close listener: {}", e);
            }
        }
        if let Some(pool) = &inner.options.pool {
            pool.close().await;
        }

        inner.set_state(State::Stopped);
        info!("Server {} stopped", inner.options.name);
        Ok(())
    }

    fn register_handler(&self, endpoint: &str, handler: HandlerFn, stream: bool) -> Result<()> {
        self.ensure_created()?;

        let handler = chain(handler, &self.inner.options.handler_wrappers);
        if self
            .inner
            .handlers
            .insert(endpoint.to_string(), Endpoint { handler, stream })
            .is_some()
        {
            warn!("Replaced handler for {}", endpoint);
        }
        Ok(())
    }

    fn ensure_created(&self) -> Result<()> {
        let state = *self.inner.state.lock();
        if state == State::Created {
            Ok(())
        } else {
            Err(Error::BadRequest(format!(
                "server {} already started ({state:?})",
                self.inner.options.name
            )))
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.stop.cancel();
        self.inner.force.cancel();
    }
}

impl Inner {
    fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    fn registration(&self) -> Registration {
        let address = self
            .options
            .advertise
            .clone()
            .or_else(|| self.address.lock().clone())
            .unwrap_or_default();

        Registration {
            name: self.options.name.clone(),
            id: self.options.id.clone(),
            version: self.options.version.clone(),
            address,
            metadata: self.options.metadata.clone(),
            ttl: self.options.register_ttl,
        }
    }

    fn registration_key(&self) -> String {
        format!("registration/{}/{}", self.options.name, self.options.id)
    }

    async fn attach_subscribers(&self) -> Result<()> {
        let subscribers = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            return Ok(());
        }
        let Some(broker) = &self.options.broker else {
            return Err(Error::NotFound(format!(
                "no broker for {} subscribers",
                subscribers.len()
            )));
        };

        for (topic, subscriber) in subscribers {
            let inflight = self.inflight.clone();
            let tracked = subscriber_fn(move |ctx: Context, publication: Publication| {
                let subscriber = subscriber.clone();
                let topic = publication.topic.clone();
                inflight.track_future(async move {
                    AssertUnwindSafe(async move { subscriber(ctx, publication).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let message = panic_message(&*panic);
                            error!("Subscriber of {} panicked: {}", topic, message);
                            Err(Error::InternalServer(format!(
                                "subscriber panicked: {message}"
                            )))
                        })
                })
            });

            let id = broker.subscribe(&topic, tracked).await?;
            self.subscriptions.lock().push(id);
            debug!("Attached subscriber to {}", topic);
        }
        Ok(())
    }

    async fn detach_subscribers(&self) {
        let Some(broker) = &self.options.broker else {
            return;
        };
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for id in subscriptions {
            if let Err(e) = broker.unsubscribe(id).await {
                warn!("Failed to detach subscriber {:?}: {}", id, e);
            }
        }
    }

    async fn register_once(&self) {
        let Some(registry) = &self.options.registry else {
            return;
        };

        if let Some(check) = &self.options.register_check {
            if let Err(e) = check(Context::background()).await {
                warn!(
                    "Register check for {} failed, skipping registration: {}",
                    self.options.name, e
                );
                return;
            }
        }

        let registration = self.registration();
        if let Err(e) = registry.register(&registration).await {
            warn!("Failed to register {}: {}", self.options.name, e);
            return;
        }
        trace!("Registered {}/{}", registration.name, registration.id);

        {
            let mut state = self.state.lock();
            if *state == State::Listening {
                *state = State::Registered;
            }
        }

        if let Some(store) = &self.options.store {
            let cached = serde_json::to_vec(&registration)
                .map_err(|e| e.to_string())
                .map(|value| Record::new(self.registration_key(), value));
            let written = match cached {
                Ok(record) => store
                    .write(
                        record,
                        WriteOptions {
                            ttl: Some(self.options.register_ttl),
                        },
                    )
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!("Failed to cache registration: {}", e);
            }
        }
    }

    async fn deregister(&self) {
        if let Some(registry) = &self.options.registry {
            match registry.deregister(&self.registration()).await {
                Ok(()) => debug!("Deregistered {}", self.options.name),
                Err(e) => warn!("Failed to deregister {}: {}", self.options.name, e),
            }
        }

        if let Some(store) = &self.options.store {
            if let Err(e) = store.delete(&self.registration_key()).await {
                warn!("Failed to drop cached registration: {}", e);
            }
        }
    }

    async fn register_loop(self: Arc<Self>) {
        let interval = self.options.register_interval;
        let Some(start) = Instant::now().checked_add(interval) else {
            // No refresh is ever due.
            self.stop.cancelled().await;
            return;
        };
        let mut ticker = interval_at(start, interval);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                _ = ticker.tick() => self.register_once().await,
            }
        }
        debug!("Registration loop for {} stopped", self.options.name);
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<dyn Listener>) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(socket) => {
                    trace!("Accepted socket from {}", socket.remote());
                    let inner = self.clone();
                    self.connections.spawn(inner.serve_socket(socket));
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("Accept loop for {} stopped", self.options.name);
    }

    async fn serve_socket(self: Arc<Self>, mut socket: Box<dyn Socket>) {
        loop {
            // A request already waiting on the socket is answered, even while
            // draining; an idle socket is closed once draining begins.
            let received = tokio::select! {
                biased;
                received = socket.recv() => received,
                () = self.stop.cancelled() => break,
            };
            let Ok(message) = received else {
                break;
            };

            let (request_id, metadata, request) = match wire::decode_request(&message) {
                Ok(decoded) => decoded,
                Err(e) => {
                    let request_id = wire::request_id(&message).unwrap_or_default().to_string();
                    if socket
                        .send(wire::encode_response(&request_id, Err(e)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            if self.stop.is_cancelled() {
                let reply = wire::encode_response(&request_id, Err(Error::ServerStopping));
                if socket.send(reply).await.is_err() {
                    break;
                }
                continue;
            }

            let mut ctx = Context::background();
            ctx.metadata_mut().extend(&metadata);
            ctx.extensions_mut().insert(RequestId(request_id.clone()));

            if request.stream {
                self.serve_stream(socket, request_id, ctx, request).await;
                return;
            }

            let result = self.dispatch(ctx, Incoming::unary(request)).await;
            if socket
                .send(wire::encode_response(&request_id, result))
                .await
                .is_err()
            {
                break;
            }
        }

        let _ = socket.close().await;
    }

    async fn serve_stream(
        &self,
        socket: Box<dyn Socket>,
        request_id: String,
        ctx: Context,
        request: Request,
    ) {
        let socket = Arc::new(tokio::sync::Mutex::new(socket));
        let stream = ServerStream::new(request_id.clone(), request.clone(), socket.clone());
        let incoming = Incoming {
            request,
            stream: Some(Box::new(stream)),
        };

        let result = self.dispatch(ctx, incoming).await;

        let mut socket = socket.lock().await;
        let _ = socket
            .send(wire::end_of_stream(&request_id, result.err().as_ref()))
            .await;
        let _ = socket.close().await;
    }

    async fn dispatch(&self, ctx: Context, incoming: Incoming) -> Result<Response> {
        let endpoint = incoming.request.endpoint.clone();
        let Some(Endpoint { handler, stream }) =
            self.handlers.get(&endpoint).map(|entry| entry.clone())
        else {
            return Err(Error::NotFound(format!("endpoint {endpoint}")));
        };
        if stream != incoming.stream.is_some() {
            let expected = if stream { "stream" } else { "unary" };
            return Err(Error::BadRequest(format!(
                "endpoint {endpoint} only accepts {expected} requests"
            )));
        }

        let invocation = self.inflight.track_future(
            AssertUnwindSafe(async move { handler(ctx, incoming).await }).catch_unwind(),
        );

        tokio::select! {
            biased;
            () = self.force.cancelled() => Err(Error::ServerStopping),
            outcome = invocation => outcome.unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                error!("Handler for {} panicked: {}", endpoint, message);
                Err(Error::InternalServer(format!("handler panicked: {message}")))
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
