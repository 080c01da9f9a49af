use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use plexus_broker::Broker;
use plexus_config::Settings;
use plexus_core::{Context, HandlerWrapper, Result, SubscriberWrapper};
use plexus_pool::Pool;
use plexus_registry::Registry;
use plexus_store::Store;
use plexus_transport::Transport;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Health gate run before every registration attempt.
pub type RegisterCheck = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builds a [`RegisterCheck`] from an async closure.
pub fn register_check<F, Fut>(f: F) -> RegisterCheck
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Everything a [`Server`](crate::Server) is built from.
#[derive(Clone)]
pub struct ServerOptions {
    /// Service name.
    pub name: String,
    /// Instance id.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Address to listen on. Empty picks one.
    pub address: String,
    /// Address published to the registry instead of the bound one.
    pub advertise: Option<String>,
    /// Metadata published with the registration.
    pub metadata: BTreeMap<String, String>,
    /// Lifetime of the registry record.
    pub register_ttl: Duration,
    /// Refresh period of the registry record.
    pub register_interval: Duration,
    /// Gate for each registration attempt.
    pub register_check: Option<RegisterCheck>,
    /// How long `stop` waits for in-flight invocations.
    pub drain_timeout: Duration,
    /// Produces the listener.
    pub transport: Arc<dyn Transport>,
    /// Where the server registers itself.
    pub registry: Option<Arc<dyn Registry>>,
    /// Where subscribers are attached.
    pub broker: Option<Arc<dyn Broker>>,
    /// Caches the current registration record.
    pub store: Option<Arc<dyn Store>>,
    /// Pool used by handlers for downstream calls; closed on stop.
    pub pool: Option<Pool>,
    /// Inbound handler wrappers, first is outermost.
    pub handler_wrappers: Vec<HandlerWrapper>,
    /// Inbound subscriber wrappers, first is outermost.
    pub subscriber_wrappers: Vec<SubscriberWrapper>,
    /// Tracks in-flight invocations instead of the server's own tracker.
    pub wait: Option<TaskTracker>,
}

impl Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("advertise", &self.advertise)
            .field("register_ttl", &self.register_ttl)
            .field("register_interval", &self.register_interval)
            .field("drain_timeout", &self.drain_timeout)
            .field("transport", &self.transport.name())
            .field("handler_wrappers", &self.handler_wrappers.len())
            .field("subscriber_wrappers", &self.subscriber_wrappers.len())
            .finish_non_exhaustive()
    }
}

impl ServerOptions {
    /// Options with defaults for everything but the name and transport.
    #[must_use]
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4().to_string(),
            version: "latest".to_string(),
            address: String::new(),
            advertise: None,
            metadata: BTreeMap::new(),
            register_ttl: Duration::from_secs(90),      // 90 seconds
            register_interval: Duration::from_secs(30), // 30 seconds
            register_check: None,
            drain_timeout: Duration::from_secs(30), // 30 seconds
            transport,
            registry: None,
            broker: None,
            store: None,
            pool: None,
            handler_wrappers: Vec::new(),
            subscriber_wrappers: Vec::new(),
            wait: None,
        }
    }

    /// Options whose timings follow `settings`.
    #[must_use]
    pub fn from_settings(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        settings: &Settings,
    ) -> Self {
        let mut options = Self::new(name, transport);
        options.register_ttl = settings.register.ttl;
        options.register_interval = settings.register.interval;
        options.drain_timeout = settings.server.drain_timeout;
        options
    }

    /// Sets the instance id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the listen address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the advertised address.
    #[must_use]
    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    /// Adds a registration metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the record lifetime and refresh period.
    #[must_use]
    pub const fn with_register_timing(mut self, ttl: Duration, interval: Duration) -> Self {
        self.register_ttl = ttl;
        self.register_interval = interval;
        self
    }

    /// Sets the registration health gate.
    #[must_use]
    pub fn with_register_check(mut self, check: RegisterCheck) -> Self {
        self.register_check = Some(check);
        self
    }

    /// Sets the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the broker.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sets the registration cache.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the pool closed on stop.
    #[must_use]
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Appends a handler wrapper.
    #[must_use]
    pub fn with_handler_wrapper(mut self, wrapper: HandlerWrapper) -> Self {
        self.handler_wrappers.push(wrapper);
        self
    }

    /// Appends a subscriber wrapper.
    #[must_use]
    pub fn with_subscriber_wrapper(mut self, wrapper: SubscriberWrapper) -> Self {
        self.subscriber_wrappers.push(wrapper);
        self
    }

    /// Tracks in-flight invocations on `tracker`.
    #[must_use]
    pub fn with_wait(mut self, tracker: TaskTracker) -> Self {
        self.wait = Some(tracker);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::Error;
    use plexus_transport::{DialOptions, Listener, Socket};

    #[derive(Debug)]
    struct NoTransport;

    #[async_trait::async_trait]
    impl Transport for NoTransport {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn dial(
            &self,
            address: &str,
            _options: &DialOptions,
        ) -> plexus_transport::Result<Box<dyn Socket>> {
            Err(plexus_transport::TransportError::connect(address, "unsupported"))
        }

        async fn listen(&self, address: &str) -> plexus_transport::Result<Box<dyn Listener>> {
            Err(plexus_transport::TransportError::bind(address, "unsupported"))
        }
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings::from_toml_str(
            "[register]\nttl = \"20s\"\ninterval = \"5s\"\n[server]\ndrain_timeout = \"1s\"\n",
        )
        .unwrap();

        let options = ServerOptions::from_settings("greeter", Arc::new(NoTransport), &settings);

        assert_eq!(options.register_ttl, Duration::from_secs(20));
        assert_eq!(options.register_interval, Duration::from_secs(5));
        assert_eq!(options.drain_timeout, Duration::from_secs(1));
        assert!(!options.id.is_empty());
    }

    #[tokio::test]
    async fn test_register_check_builder() {
        let check = register_check(|ctx: Context| async move {
            match ctx.metadata().get("healthy") {
                Some(_) => Ok(()),
                None => Err(Error::InternalServer("unhealthy".to_string())),
            }
        });

        assert!(check(Context::background()).await.is_err());
        assert!(
            check(Context::background().with_metadata("healthy", "yes"))
                .await
                .is_ok()
        );
    }
}
