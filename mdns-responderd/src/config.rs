use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use mdns_core::{EngineConfig, ServiceSpec};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host label to advertise under `.local`; the system hostname if unset.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
    /// Service types to browse. Empty means every type on the link.
    #[serde(default)]
    pub browse: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance: String,
    pub service_type: String,
    pub port: u16,
    #[serde(default)]
    pub txt: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn to_spec(&self) -> ServiceSpec {
        self.txt.iter().fold(
            ServiceSpec::new(&self.instance, &self.service_type, self.port),
            |spec, (key, value)| spec.with_txt(key, value),
        )
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.instance, self.service_type)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The configured hostname, or the system one.
    pub fn hostname(&self) -> Result<String> {
        if let Some(name) = &self.hostname {
            return Ok(name.clone());
        }
        let name = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();
        // A dotted system name keeps only its first label under .local
        Ok(name.split('.').next().unwrap_or_default().to_string())
    }
}
