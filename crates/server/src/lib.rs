//! Server side of the plexus invocation pipeline.
//!
//! A [`Server`] binds a transport listener, serves each accepted socket on
//! its own task, and runs every request through the inbound handler chain.
//! Panicking handlers are answered with an internal-server error rather than
//! taking the connection task down. In the background it keeps its registry
//! record fresh; on stop it drains in-flight work before deregistering.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod options;
mod server;
mod stream;

pub use options::{RegisterCheck, ServerOptions, register_check};
pub use server::{Server, State};
pub use stream::ServerStream;

/// Request id of the inbound call, stored in the handler's context
/// extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);
