//! Per-call context: metadata, deadline, cancellation and typed extensions.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::future::Future;
use std::time::Duration;

use http::Extensions;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{Error, Result};

/// Header prefix under which metadata travels on the wire.
pub const METADATA_PREFIX: &str = "x-md-";

/// Key/value metadata propagated with a call. Keys are stored lower-case.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into())
    }

    /// Removes a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies every entry of `other` into `self`, overwriting.
    pub fn extend(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Writes entries into a wire header under [`METADATA_PREFIX`].
    pub fn write_header(&self, header: &mut BTreeMap<String, String>) {
        for (key, value) in &self.0 {
            header.insert(format!("{METADATA_PREFIX}{key}"), value.clone());
        }
    }

    /// Collects the prefixed entries of a wire header.
    #[must_use]
    pub fn from_header(header: &BTreeMap<String, String>) -> Self {
        let mut metadata = Self::new();
        for (key, value) in header {
            if let Some(key) = key.strip_prefix(METADATA_PREFIX) {
                metadata.insert(key, value.clone());
            }
        }
        metadata
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Carrier for everything a call needs besides its payload.
///
/// Cloning is cheap and clones share the cancellation token. Use
/// [`Context::child`] for a context that can be cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct Context {
    metadata: Metadata,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    extensions: Extensions,
}

impl Context {
    /// A fresh context with no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Same context with its deadline moved to at most `timeout` from now.
    /// A timeout too large to represent leaves the deadline unchanged.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    /// Same context with its deadline moved to at most `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Same context with one more metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// A copy whose cancellation follows this context but can also be
    /// cancelled independently.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            extensions: self.extensions.clone(),
        }
    }

    /// Call metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable call metadata.
    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Typed values attached in-process, never sent over the wire.
    #[must_use]
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable typed values.
    pub const fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Cancels this context and every child.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// The underlying cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails fast if the context is already cancelled or expired.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] or [`Error::Timeout`].
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_expired() {
            return Err(Error::Timeout("context deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Drives `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever happens first.
    ///
    /// # Errors
    ///
    /// The future's own error, [`Error::Cancelled`] or [`Error::Timeout`].
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = expired => Err(Error::Timeout("context deadline exceeded".to_string())),
            result = fut => result,
        }
    }
}
