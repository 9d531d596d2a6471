use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn default_enabled() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_interval() -> u64 {
    60
}

fn default_last_run_threshold() -> u64 {
    300
}

/// The agent's TOML configuration: where provider sockets live, which
/// check containers to run, and which network services to expose.
#[derive(Debug, Deserialize)]
pub struct AgentConfigFile {
    pub socket_dir: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub container: Vec<ContainerEntry>,
    #[serde(default)]
    pub service: Vec<ServiceEntry>,
}

impl AgentConfigFile {
    fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        use std::io::Read;
        let mut config = String::new();
        std::fs::File::open(&crate::cli::get_cli_args().config)?.read_to_string(&mut config)?;
        Self::try_init_from_string(&config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerEntry {
    pub name: String,
    /// Executable plus arguments, exec-style; no shell interpretation.
    pub command: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ServiceKind {
    #[serde(alias = "nrpe", alias = "NRPE")]
    Nrpe,
    #[serde(alias = "carbon", alias = "Carbon")]
    Carbon,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub port: u16,
    /// Backend endpoints as "host:port", tried in order.
    #[serde(default)]
    pub dial_on: Vec<String>,
    #[serde(default = "default_last_run_threshold")]
    pub last_run_threshold_seconds: u64,
    #[serde(default = "default_relay_interval")]
    pub relay_interval_seconds: u64,
}

impl ServiceEntry {
    pub fn last_run_threshold(&self) -> Duration {
        Duration::from_secs(self.last_run_threshold_seconds)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_secs(self.relay_interval_seconds)
    }
}
