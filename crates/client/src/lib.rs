//! Client side of the plexus invocation pipeline.
//!
//! A call resolves the service, takes a socket from the pool, sends the
//! encoded request through the outbound call chain and releases the socket
//! again: reusable when the exchange completed, discarded otherwise.
//! Streams take a socket out of the pool for good. Publishes go through the
//! publish chain to the broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod options;
mod stream;

pub use client::Client;
pub use options::{CallOptions, ClientOptions, PublishOptions, RetryPolicy, RetryPredicate};
pub use stream::ClientStream;
