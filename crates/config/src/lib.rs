//! Configuration for plexus.
//!
//! Two halves: [`Settings`] are the static knobs loaded once from TOML, and
//! [`Source`] is the contract for dynamic key/value configuration that can
//! change while the process runs.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod memory;
mod settings;
mod source;

pub use error::ConfigError;
pub use memory::MemorySource;
pub use settings::{PoolSettings, RegisterSettings, ServerSettings, Settings};
pub use source::{
    ChangeEvent, ChangeKind, DEFAULT_GROUP, Listener, ListenerId, Source, normalize_group,
};

/// Result alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
