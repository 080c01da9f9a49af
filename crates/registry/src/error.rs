use thiserror::Error;

/// Errors from registries and resolvers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The record is invalid (empty name, id or address).
    #[error("invalid registration: {0}")]
    Invalid(String),
}
