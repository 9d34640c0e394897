//! Storage configuration.
//!
//! A backend is built from a flat bundle of string settings, normally one
//! section of an INI file:
//!
//! ```ini
//! [storage]
//! type = memcached
//! options = --SERVER=cache1:11211 --SERVER=cache2
//! expire = 1440
//! ```
//!
//! Each backend reads the keys it knows about with typed accessors and falls
//! back to its own defaults; unknown keys are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ini::Ini;
use thiserror::Error;

/// Section read when none is named.
pub const DEFAULT_SECTION: &str = "storage";

/// Key naming the backend type.
pub const TYPE_KEY: &str = "type";

/// Largest expiry, in minutes, that is honoured.
///
/// memcached reads anything longer than 30 days as an absolute timestamp,
/// so longer values are treated as "never expire".
pub const MAX_EXPIRE_MINUTES: i64 = 30 * 24 * 60;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// The requested section is not in the file
    #[error("Config file has no [{0}] section")]
    MissingSection(String),

    /// A key the backend cannot do without is not set
    #[error("Missing required configuration key '{0}'")]
    MissingKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {key} = '{value}' - {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Settings used to construct one storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    values: HashMap<String, String>,
}

impl StorageConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration selecting the given backend type.
    pub fn for_type(backend: impl Into<String>) -> Self {
        Self::new().with(TYPE_KEY, backend)
    }

    /// Set a value, replacing any previous one.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Load one section of an INI file.
    pub fn load_from(path: &Path, section: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path)?;
        Self::from_ini(&ini, section)
    }

    /// Extract one section of a parsed INI document.
    pub fn from_ini(ini: &Ini, section: &str) -> Result<Self, ConfigError> {
        let properties = ini
            .section(Some(section))
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;

        let values = properties
            .iter()
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Ok(Self { values })
    }

    /// Raw string value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// String value for a key, or `default` if unset.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Non-empty string value for a key that must be set.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Parsed value for a key, or `default` if unset.
    ///
    /// A value that is present but does not parse is an error rather than a
    /// silent fallback, since it almost always means a typo in the file.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// The backend type this configuration selects.
    pub fn backend_type(&self) -> Option<&str> {
        self.get(TYPE_KEY).filter(|t| !t.is_empty())
    }

    /// Expiry in minutes from the `expire` key, clamped to what backends
    /// can honour.
    ///
    /// Negative values and values above [`MAX_EXPIRE_MINUTES`] become `0`,
    /// meaning "never expire".
    pub fn expire_minutes(&self) -> Result<u32, ConfigError> {
        let minutes: i64 = self.parse_or("expire", 0)?;
        if (0..=MAX_EXPIRE_MINUTES).contains(&minutes) {
            Ok(minutes as u32)
        } else {
            Ok(0)
        }
    }

    /// Iterate over all key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Get the path to the config directory (~/.tilestore).
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tilestore")
}

/// Get the path to the config file (~/.tilestore/config.ini).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
