//! Core types of the plexus invocation pipeline.
//!
//! This crate holds what clients, servers, brokers and middleware share:
//! the call [`Context`], the request/response envelopes, the error taxonomy,
//! body codecs, the wire mapping onto transport messages, and the wrapper
//! types with their composition rule.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod context;
mod error;
mod message;
pub mod wire;
pub mod wrapper;

pub use codec::Codec;
pub use context::{Context, METADATA_PREFIX, Metadata};
pub use error::{Error, ErrorKind, Result};
pub use message::{Incoming, Publication, Request, Response, Stream};
pub use wrapper::{
    CallFn, CallWrapper, HandlerFn, HandlerWrapper, PublishFn, PublishWrapper, StreamFn,
    StreamWrapper, SubscriberFn, SubscriberWrapper, Wrapper, call_fn, chain, handler_fn,
    publish_fn, stream_fn, subscriber_fn,
};
