use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::{Registration, Registry, RegistryError, Result};

type Records = BTreeMap<String, (Registration, Instant)>;

/// Expiry used when `now + ttl` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30); // 30 years

/// In-process registry. Each record expires `ttl` after its last
/// registration; expired records are invisible and pruned on access.
///
/// Clones share the same records.
#[derive(Clone, Debug)]
pub struct MemoryRegistry {
    services: Arc<DashMap<String, Records>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`RegistryError::Unavailable`] until
    /// re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("memory registry disabled".to_string()))
        }
    }

    fn prune(records: &mut Records, now: Instant) {
        records.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.check_available()?;
        if registration.name.is_empty()
            || registration.id.is_empty()
            || registration.address.is_empty()
        {
            return Err(RegistryError::Invalid(format!("{registration:?}")));
        }

        let now = Instant::now();
        let expires_at = now
            .checked_add(registration.ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.services
            .entry(registration.name.clone())
            .or_default()
            .insert(registration.id.clone(), (registration.clone(), expires_at));

        debug!(
            "Registered {}/{} at {}",
            registration.name, registration.id, registration.address
        );
        Ok(())
    }

    async fn deregister(&self, registration: &Registration) -> Result<()> {
        self.check_available()?;

        self.services.remove_if_mut(&registration.name, |_, records| {
            records.remove(&registration.id);
            records.is_empty()
        });

        debug!("Deregistered {}/{}", registration.name, registration.id);
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Registration>> {
        self.check_available()?;

        let now = Instant::now();
        let Some(mut records) = self.services.get_mut(name) else {
            return Ok(Vec::new());
        };
        Self::prune(&mut records, now);

        Ok(records
            .values()
            .map(|(registration, _)| registration.clone())
            .collect())
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        self.check_available()?;

        let now = Instant::now();
        self.services.retain(|_, records| {
            Self::prune(records, now);
            !records.is_empty()
        });

        let mut names: Vec<String> = self
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
