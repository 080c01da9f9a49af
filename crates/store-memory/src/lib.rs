//! In-memory (single node) implementation of the key/value store for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use plexus_store::{ListOptions, ReadOptions, Record, Result, Store, StoreError, WriteOptions};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct Stored {
    value: Bytes,
    metadata: BTreeMap<String, String>,
    expires_at: Option<Instant>,
}

/// In-memory key-value store.
///
/// [`MemoryStore::scope`] returns a view of the same data under a key prefix.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<BTreeMap<String, Stored>>>,
    closed: Arc<AtomicBool>,
    prefix: Option<String>,
}

impl MemoryStore {
    /// Creates a new `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A view of this store whose keys live under `scope`.
    #[must_use]
    pub fn scope(&self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}:{scope}"),
            None => scope,
        };
        Self {
            map: self.map.clone(),
            closed: self.closed.clone(),
            prefix: Some(prefix),
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    fn user_key<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':')),
            None => Some(full_key),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn to_record(key: &str, stored: &Stored, now: Instant) -> Record {
        Record {
            key: key.to_string(),
            value: stored.value.clone(),
            metadata: stored.metadata.clone(),
            expiry: stored
                .expires_at
                .map(|at| at.saturating_duration_since(now)),
        }
    }
}

fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items.skip(offset).take(limit.unwrap_or(usize::MAX)).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str, options: ReadOptions) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut map = self.map.lock().await;
        map.retain(|_, stored| stored.expires_at.is_none_or(|at| at > now));

        if !options.prefix {
            let stored = map
                .get(&self.full_key(key))
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            return Ok(vec![Self::to_record(key, stored, now)]);
        }

        let full_prefix = self.full_key(key);
        let matches = map
            .range(full_prefix.clone()..)
            .take_while(|(full_key, _)| full_key.starts_with(&full_prefix))
            .filter_map(|(full_key, stored)| {
                self.user_key(full_key)
                    .map(|user_key| Self::to_record(user_key, stored, now))
            });

        Ok(page(matches, options.offset, options.limit))
    }

    async fn write(&self, record: Record, options: WriteOptions) -> Result<()> {
        self.ensure_open()?;
        let expires_at = options
            .ttl
            .or(record.expiry)
            .and_then(|ttl| Instant::now().checked_add(ttl));

        self.map.lock().await.insert(
            self.full_key(&record.key),
            Stored {
                value: record.value,
                metadata: record.metadata,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.map.lock().await.remove(&self.full_key(key));
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut map = self.map.lock().await;
        map.retain(|_, stored| stored.expires_at.is_none_or(|at| at > now));

        let wanted = options.prefix.unwrap_or_default();
        let keys = map
            .keys()
            .filter_map(|full_key| self.user_key(full_key))
            .filter(|user_key| user_key.starts_with(&wanted))
            .map(str::to_string);

        Ok(page(keys, options.offset, options.limit))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
