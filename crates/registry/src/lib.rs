//! Service discovery for plexus.
//!
//! A [`Registry`] holds the registration records servers publish about
//! themselves; a [`Resolver`] turns a service name into candidate addresses
//! for the client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod memory;
mod resolver;

pub use error::RegistryError;
pub use memory::MemoryRegistry;
pub use resolver::{RegistryResolver, Resolver, StaticResolver};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A server instance's advertised presence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Service name.
    pub name: String,
    /// Unique instance id.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Address clients should dial.
    pub address: String,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// How long the record stays valid without a refresh.
    pub ttl: Duration,
}

/// Durable store of registration records.
#[async_trait]
pub trait Registry: Debug + Send + Sync + 'static {
    /// Publishes or refreshes a record.
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// Removes a record. Removing an unknown record is not an error.
    async fn deregister(&self, registration: &Registration) -> Result<()>;

    /// Live records for `name`.
    async fn get_service(&self, name: &str) -> Result<Vec<Registration>>;

    /// Names of services with at least one live record.
    async fn list_services(&self) -> Result<Vec<String>>;
}
