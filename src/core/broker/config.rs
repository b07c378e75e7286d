// src/core/broker/config.rs

use crate::core::transport::Capabilities;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Capability names advertised to clients, e.g. `ACTIVE_FLOW_INDICATION`.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    #[serde(default = "default_allow_provisioning")]
    pub allow_provisioning: bool,

    /// How long open connections may drain after a shutdown signal.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    55555
}

fn default_capabilities() -> Vec<String> {
    Capabilities::all()
        .iter_names()
        .map(|(name, _)| name.to_string())
        .collect()
}

fn default_allow_provisioning() -> bool {
    true
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            capabilities: default_capabilities(),
            allow_provisioning: default_allow_provisioning(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl BrokerConfig {
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read broker config \"{path}\""))?;
        let config: BrokerConfig = toml::from_str(&content)?;
        config.capability_set()?;
        Ok(config)
    }

    /// Resolves the configured capability names into a flag set.
    pub fn capability_set(&self) -> Result<Capabilities> {
        self.capabilities
            .iter()
            .try_fold(Capabilities::empty(), |set, name| {
                Capabilities::from_name(&name.to_ascii_uppercase())
                    .map(|flag| set | flag)
                    .ok_or_else(|| anyhow!("Unknown broker capability '{name}'"))
            })
    }
}
