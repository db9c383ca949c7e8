//! Daemon configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address; port 0 = OS-assigned.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seed peers dialed at startup, as `host:port`.
    #[serde(default)]
    pub seed_addrs: Vec<String>,
    /// Retry attempts per seed before giving up.
    #[serde(default = "default_seed_retries")]
    pub seed_retries: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Tracing filter directive, e.g. "weft=debug".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions

fn default_listen_addr() -> String {
    "0.0.0.0:4400".to_string()
}

fn default_seed_retries() -> u32 {
    3
}

fn default_log_filter() -> String {
    "weft=info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            seed_addrs: Vec::new(),
            seed_retries: default_seed_retries(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the config file.
    ///
    /// The path comes from `WEFT_CONFIG` when set, otherwise
    /// `./weft.toml`. Missing file falls back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// The config file path, honoring the env override.
    fn config_path() -> PathBuf {
        std::env::var("WEFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("weft.toml"))
    }
}
