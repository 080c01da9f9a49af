use thiserror::Error;

/// Errors from settings loading and dynamic config sources.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read config file: {0}")]
    Read(String),

    /// The settings document is malformed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The settings parsed but are inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The source has been closed.
    #[error("config source closed")]
    Closed,
}
