//! Connection pool keyed by remote address.
//!
//! The pool keeps up to `size` idle sockets per address and hands them out
//! LIFO. A socket that has been idle for `ttl` or longer is closed instead of
//! being handed out; that check happens lazily in [`Pool::get`], with an
//! optional background sweep for addresses that are never asked for again.
//!
//! The idle map is the only shared state. Its lock is held for map and vector
//! mutation only; dialing and closing always happen outside it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use plexus_transport::{DialOptions, Result, Socket, Transport, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Configuration for the pool
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Maximum idle sockets kept per address
    pub size: usize,
    /// Maximum idle time before a socket is discarded
    pub ttl: Duration,
    /// Timeout applied to each dial
    pub dial_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 2,
            ttl: Duration::from_secs(60),         // 1 minute
            dial_timeout: Duration::from_secs(5), // 5 seconds
        }
    }
}

struct Entry {
    socket: Box<dyn Socket>,
    created_at: Instant,
    last_used_at: Instant,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: PoolOptions,
    idle: Mutex<HashMap<String, Vec<Entry>>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<CancellationToken>>,
    sweepers: TaskTracker,
}

/// A socket checked out of the pool.
///
/// Dereferences to the underlying [`Socket`]. Hand it back with
/// [`Pool::release`]; dropping it instead simply drops the connection.
pub struct PooledSocket {
    socket: Box<dyn Socket>,
    address: String,
    created_at: Instant,
    reused: bool,
}

impl PooledSocket {
    /// Address the socket was dialed to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the socket was dialed.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the socket came from the idle set rather than a fresh dial.
    #[must_use]
    pub const fn is_reused(&self) -> bool {
        self.reused
    }

    /// Detaches the socket from the pool for good.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Socket> {
        self.socket
    }
}

impl Deref for PooledSocket {
    type Target = dyn Socket;

    fn deref(&self) -> &Self::Target {
        self.socket.as_ref()
    }
}

impl DerefMut for PooledSocket {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.socket.as_mut()
    }
}

impl Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("socket", &self.socket)
            .field("address", &self.address)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

/// Pool of reusable sockets.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("transport", &self.inner.transport.name())
            .field("options", &self.inner.options)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool dialing through `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                idle: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                sweepers: TaskTracker::new(),
            }),
        }
    }

    /// The pool's configuration
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// The transport new sockets are dialed with
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Whether [`Pool::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of idle sockets held for `address`
    #[must_use]
    pub fn idle_count(&self, address: &str) -> usize {
        self.inner.idle.lock().get(address).map_or(0, Vec::len)
    }

    /// Check out a socket for `address`, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the pool is closed, otherwise whatever
    /// the transport's dial returned.
    pub async fn get(&self, address: &str) -> Result<PooledSocket> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (hit, stale) = self.take_idle(address);
        close_all(stale).await;

        if let Some(entry) = hit {
            trace!(
                "Reusing socket {} for {} (idle since {:?})",
                entry.socket.id(),
                address,
                entry.last_used_at
            );
            return Ok(PooledSocket {
                socket: entry.socket,
                address: address.to_string(),
                created_at: entry.created_at,
                reused: true,
            });
        }

        let options = DialOptions {
            timeout: self.inner.options.dial_timeout,
            stream: false,
        };
        let socket = tokio::time::timeout(
            options.timeout,
            self.inner.transport.dial(address, &options),
        )
        .await
        .map_err(|_| TransportError::Timeout(format!("dial {address}")))??;

        debug!("Dialed new socket {} to {}", socket.id(), address);

        Ok(PooledSocket {
            socket,
            address: address.to_string(),
            created_at: Instant::now(),
            reused: false,
        })
    }

    /// Return a checked-out socket.
    ///
    /// The socket goes back to the idle set only if `reusable`, the pool is
    /// open, the socket still looks open and the address is below its bound.
    /// Otherwise it is closed.
    pub async fn release(&self, socket: PooledSocket, reusable: bool) {
        let PooledSocket {
            socket,
            address,
            created_at,
            ..
        } = socket;

        let rejected = if reusable && socket.is_open() {
            let mut idle = self.inner.idle.lock();
            let held = idle.get(&address).map_or(0, Vec::len);
            if self.is_closed() || held >= self.inner.options.size {
                Some(socket)
            } else {
                idle.entry(address.clone()).or_default().push(Entry {
                    socket,
                    created_at,
                    last_used_at: Instant::now(),
                });
                None
            }
        } else {
            Some(socket)
        };

        if let Some(mut socket) = rejected {
            trace!("Closing released socket {} for {}", socket.id(), address);
            if let Err(e) = socket.close().await {
                debug!("Error closing socket for {}: {}", address, e);
            }
        }
    }

    /// Close every expired idle socket. Returns how many were closed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut idle = self.inner.idle.lock();
            let mut expired = Vec::new();
            idle.retain(|_, entries| {
                let (keep, stale): (Vec<Entry>, Vec<Entry>) = entries
                    .drain(..)
                    .partition(|entry| !self.is_stale(entry, now));
                expired.extend(stale);
                *entries = keep;
                !entries.is_empty()
            });
            expired
        };

        let count = expired.len();
        if count > 0 {
            debug!("Swept {} expired sockets", count);
        }
        close_all(expired).await;
        count
    }

    /// Run [`Pool::sweep`] every `interval` on a background task owned by the
    /// pool. Stopped by [`Pool::close`]. Calling it again replaces the task;
    /// calling it on a closed pool does nothing.
    pub fn spawn_sweeper(&self, interval: Duration) {
        // Held across the closed check so close() sees every spawned sweeper.
        let mut current = self.inner.sweeper.lock();
        if self.is_closed() {
            debug!("Pool closed, not starting sweeper");
            return;
        }

        let cancel = CancellationToken::new();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = cancel.clone();

        self.inner.sweepers.spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                Self { inner }.sweep().await;
            }
        });

        if let Some(previous) = current.replace(cancel) {
            previous.cancel();
        }
    }

    /// Close the pool and every idle socket. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self.inner.sweeper.lock().take();
        if let Some(cancel) = sweeper {
            cancel.cancel();
        }
        self.inner.sweepers.close();
        self.inner.sweepers.wait().await;

        let drained: Vec<Entry> = self
            .inner
            .idle
            .lock()
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();

        debug!("Closing pool with {} idle sockets", drained.len());
        close_all(drained).await;
    }

    fn take_idle(&self, address: &str) -> (Option<Entry>, Vec<Entry>) {
        let now = Instant::now();
        let mut stale = Vec::new();
        let mut hit = None;

        let mut idle = self.inner.idle.lock();
        let Some(entries) = idle.get_mut(address) else {
            return (None, stale);
        };

        while let Some(entry) = entries.pop() {
            if self.is_stale(&entry, now) || !entry.socket.is_open() {
                stale.push(entry);
            } else {
                hit = Some(entry);
                break;
            }
        }

        if entries.is_empty() {
            idle.remove(address);
        }

        (hit, stale)
    }

    fn is_stale(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_used_at) >= self.inner.options.ttl
    }
}

async fn close_all(entries: Vec<Entry>) {
    for mut entry in entries {
        if let Err(e) = entry.socket.close().await {
            debug!("Error closing idle socket: {}", e);
        }
    }
}
