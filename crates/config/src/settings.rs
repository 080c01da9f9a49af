use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Static settings recognised by the client and server.
///
/// Every section and field is optional in the TOML document; missing ones
/// take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connection pool settings.
    pub pool: PoolSettings,

    /// Registry settings.
    pub register: RegisterSettings,

    /// Server settings.
    pub server: ServerSettings,
}

/// Connection pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Max idle sockets per address.
    pub size: usize,

    /// Max age of an idle socket.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Dial timeout.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 2,
            ttl: Duration::from_secs(60),         // 1 minute
            dial_timeout: Duration::from_secs(5), // 5 seconds
        }
    }
}

/// Registry settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterSettings {
    /// Lifetime of the registry record.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Refresh period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RegisterSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(90),      // 90 seconds
            interval: Duration::from_secs(30), // 30 seconds
        }
    }
}

/// Server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// How long a stopping server waits for in-flight work.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30), // 30 seconds
        }
    }
}

impl Settings {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed input, [`ConfigError::Invalid`]
    /// when the values are inconsistent.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`Settings::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&contents)
    }

    /// Renders the settings as TOML.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks the values against each other.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when the pool size or the refresh interval is
    /// zero, or the registration would expire between two refreshes.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".to_string()));
        }

        if self.register.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "register.interval must be greater than zero".to_string(),
            ));
        }

        if self.register.interval >= self.register.ttl {
            return Err(ConfigError::Invalid(format!(
                "register.interval ({:?}) must be shorter than register.ttl ({:?})",
                self.register.interval, self.register.ttl
            )));
        }

        Ok(())
    }
}
