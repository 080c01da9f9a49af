//! Key/value store contract used for durable side-channel state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur in a store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record under the key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store has been closed.
    #[error("store closed")]
    Closed,

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One stored item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Key.
    pub key: String,
    /// Value.
    pub value: Bytes,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// Time left before the record expires. `None` means never.
    pub expiry: Option<Duration>,
}

impl Record {
    /// A record with no metadata and no expiry.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// Options for [`Store::read`].
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// Treat the key as a prefix and return every match.
    pub prefix: bool,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Number of matching records to skip.
    pub offset: usize,
}

/// Options for [`Store::write`].
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Overrides the record's own expiry.
    pub ttl: Option<Duration>,
}

/// Options for [`Store::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Maximum number of keys to return.
    pub limit: Option<usize>,
    /// Number of matching keys to skip.
    pub offset: usize,
}

/// A key/value store with record metadata and expiry.
///
/// Keys are returned in ascending order by `read` with `prefix` and by
/// `list`; `limit` and `offset` apply to that order.
#[async_trait]
pub trait Store: Debug + Send + Sync + 'static {
    /// Reads the record under `key`, or every record under a prefix.
    ///
    /// A missing key without `prefix` is [`StoreError::NotFound`]; a prefix
    /// with no match is an empty list.
    async fn read(&self, key: &str, options: ReadOptions) -> Result<Vec<Record>>;

    /// Writes a record, replacing any previous one under the same key.
    async fn write(&self, record: Record, options: WriteOptions) -> Result<()>;

    /// Deletes the record under `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys.
    async fn list(&self, options: ListOptions) -> Result<Vec<String>>;

    /// Releases the store. Later operations fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<()>;
}
