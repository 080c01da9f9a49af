use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use plexus_broker::Broker;
use plexus_config::Settings;
use plexus_core::codec::CONTENT_TYPE_CBOR;
use plexus_core::{CallWrapper, Error, PublishWrapper, StreamWrapper};
use plexus_pool::{Pool, PoolOptions};
use plexus_registry::Resolver;
use plexus_transport::Transport;

/// Decides whether a failed attempt is worth another try.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy with exponential backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Which errors are retried.
    pub retry_on: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            retry_on: Arc::new(Error::is_transient),
        }
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A policy making up to `max_attempts` attempts.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the backoff delays.
    #[must_use]
    pub const fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// Sets which errors are retried.
    #[must_use]
    pub fn with_retry_on(mut self, retry_on: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Arc::new(retry_on);
        self
    }

    pub(crate) fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        attempt < self.max_attempts && (self.retry_on)(error)
    }

    /// Unrepresentable products (negative, NaN, overflowing) fall back to
    /// `max_delay`.
    pub(crate) fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-call overrides. Unset fields fall back to the client's options.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Dial this address instead of resolving the service.
    pub address: Option<String>,
    /// Timeout of one attempt.
    pub request_timeout: Option<Duration>,
    /// Retry policy.
    pub retry: Option<RetryPolicy>,
    /// Body encoding.
    pub content_type: Option<String>,
}

impl CallOptions {
    /// Targets `address` directly.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Overrides the per-attempt timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Overrides the body encoding.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Options for [`Client::publish`](crate::Client::publish).
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Body encoding.
    pub content_type: Option<String>,
}

/// Everything a [`Client`](crate::Client) is built from.
#[derive(Clone)]
pub struct ClientOptions {
    /// Produces sockets for the pool.
    pub transport: Arc<dyn Transport>,
    /// Turns service names into addresses.
    pub resolver: Arc<dyn Resolver>,
    /// Terminal of the publish chain.
    pub broker: Option<Arc<dyn Broker>>,
    /// Pool settings, used unless `pool` is set.
    pub pool_options: PoolOptions,
    /// An existing pool to share.
    pub pool: Option<Pool>,
    /// Period of the idle sweeper; `None` leaves expiry to `get`.
    pub sweep_interval: Option<Duration>,
    /// Default body encoding.
    pub content_type: String,
    /// Default timeout of one attempt.
    pub request_timeout: Duration,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Outbound call wrappers, first is outermost.
    pub call_wrappers: Vec<CallWrapper>,
    /// Outbound stream wrappers, first is outermost.
    pub stream_wrappers: Vec<StreamWrapper>,
    /// Outbound publish wrappers, first is outermost.
    pub publish_wrappers: Vec<PublishWrapper>,
}

impl Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("transport", &self.transport)
            .field("resolver", &self.resolver)
            .field("broker", &self.broker)
            .field("pool_options", &self.pool_options)
            .field("sweep_interval", &self.sweep_interval)
            .field("content_type", &self.content_type)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("call_wrappers", &self.call_wrappers.len())
            .field("stream_wrappers", &self.stream_wrappers.len())
            .field("publish_wrappers", &self.publish_wrappers.len())
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Options with defaults for everything but the transport and resolver.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            transport,
            resolver,
            broker: None,
            pool_options: PoolOptions::default(),
            pool: None,
            sweep_interval: None,
            content_type: CONTENT_TYPE_CBOR.to_string(),
            request_timeout: Duration::from_secs(5), // 5 seconds
            retry: RetryPolicy::default(),
            call_wrappers: Vec::new(),
            stream_wrappers: Vec::new(),
            publish_wrappers: Vec::new(),
        }
    }

    /// Options whose pool follows `settings`.
    #[must_use]
    pub fn from_settings(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn Resolver>,
        settings: &Settings,
    ) -> Self {
        Self::new(transport, resolver).with_pool_options(PoolOptions {
            size: settings.pool.size,
            ttl: settings.pool.ttl,
            dial_timeout: settings.pool.dial_timeout,
        })
    }

    /// Sets the broker used by publish.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sets the pool settings.
    #[must_use]
    pub const fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    /// Shares an existing pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Runs a background sweeper every `interval`.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Sets the default body encoding.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Appends an outbound call wrapper.
    #[must_use]
    pub fn with_call_wrapper(mut self, wrapper: CallWrapper) -> Self {
        self.call_wrappers.push(wrapper);
        self
    }

    /// Appends an outbound stream wrapper.
    #[must_use]
    pub fn with_stream_wrapper(mut self, wrapper: StreamWrapper) -> Self {
        self.stream_wrappers.push(wrapper);
        self
    }

    /// Appends an outbound publish wrapper.
    #[must_use]
    pub fn with_publish_wrapper(mut self, wrapper: PublishWrapper) -> Self {
        self.publish_wrappers.push(wrapper);
        self
    }
}
