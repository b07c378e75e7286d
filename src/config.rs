// src/config.rs

//! Client configuration: the log level and the broker session properties.

use crate::core::FtError;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

/// Well-known session property keys.
pub mod keys {
    /// Comma-separated `host:port` list, tried in order.
    pub const HOST: &str = "host";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const VPN_NAME: &str = "vpn_name";
    /// Name the session announces to the broker. Generated when absent.
    pub const CLIENT_NAME: &str = "client_name";
    pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PORT: u16 = 55555;

/// The string-to-string mapping a broker session is built from.
///
/// Unknown keys are kept; they are transport-specific and simply ignored by
/// transports that do not understand them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProperties(BTreeMap<String, String>);

/// A TOML scalar accepted as a property value.
#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl PropertyValue {
    fn into_string(self) -> String {
        match self {
            PropertyValue::String(s) => s,
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Boolean(b) => b.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for SessionProperties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, PropertyValue>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(key, value)| (key, value.into_string()))
                .collect(),
        ))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl SessionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The broker addresses to try, in order. A bare host gets the default port.
    pub fn hosts(&self) -> Vec<String> {
        self.get(keys::HOST)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                if h.contains(':') {
                    h.to_string()
                } else {
                    format!("{h}:{DEFAULT_PORT}")
                }
            })
            .collect()
    }

    pub fn connect_timeout(&self) -> Result<Duration, FtError> {
        match self.get(keys::CONNECT_TIMEOUT_MS) {
            None => Ok(DEFAULT_CONNECT_TIMEOUT),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| {
                    FtError::Config(format!(
                        "'{}' must be a number of milliseconds, got '{raw}'",
                        keys::CONNECT_TIMEOUT_MS
                    ))
                }),
        }
    }

    /// Checks that the properties are usable for a remote session.
    pub fn validate(&self) -> Result<(), FtError> {
        if self.hosts().is_empty() {
            return Err(FtError::Config(format!(
                "session property '{}' is required",
                keys::HOST
            )));
        }
        self.connect_timeout()?;
        Ok(())
    }
}

/// The client configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub session: SessionProperties,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionProperties::default(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read \"{path}\""))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse \"{path}\""))?;
        config
            .session
            .validate()
            .map_err(|e| anyhow!("Invalid configuration in \"{path}\": {e}"))?;
        Ok(config)
    }
}
