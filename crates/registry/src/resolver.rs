use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{Registry, Result};

/// Turns a service name into candidate addresses.
///
/// An empty result means "nothing to route to"; callers surface it as a
/// not-found error.
#[async_trait]
pub trait Resolver: Debug + Send + Sync + 'static {
    /// Addresses currently serving `service`.
    async fn resolve(&self, service: &str) -> Result<Vec<String>>;
}

/// Resolves through a [`Registry`].
#[derive(Clone, Debug)]
pub struct RegistryResolver {
    registry: Arc<dyn Registry>,
}

impl RegistryResolver {
    /// Wraps `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, service: &str) -> Result<Vec<String>> {
        let mut addresses: Vec<String> = self
            .registry
            .get_service(service)
            .await?
            .into_iter()
            .map(|registration| registration.address)
            .collect();
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }
}

/// Fixed service-to-address table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    routes: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the addresses of `service`.
    #[must_use]
    pub fn with_route<I, S>(mut self, service: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.insert(
            service.into(),
            addresses.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, service: &str) -> Result<Vec<String>> {
        Ok(self.routes.get(service).cloned().unwrap_or_default())
    }
}
