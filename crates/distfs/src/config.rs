use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::session::MountOptions;

/// External filter program and the file extensions it applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Program and arguments. Empty means content is served unchanged.
    pub command: Vec<String>,
    /// Extensions to filter, without the dot. Empty means every file.
    pub extensions: Vec<String>,
}

/// Daemon configuration, loaded from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistFsConfig {
    /// How long the kernel may cache attributes.
    pub attr_timeout_ms: u64,
    /// How long the kernel may cache name lookups.
    pub entry_timeout_ms: u64,
    /// FUSE mount options.
    pub mount: MountOptions,
    /// Content filter.
    pub filter: FilterConfig,
}

impl Default for DistFsConfig {
    fn default() -> Self {
        Self {
            attr_timeout_ms: 1000,
            entry_timeout_ms: 1000,
            mount: MountOptions::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl DistFsConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: DistFsConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: DistFsConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Attribute TTL handed to the kernel.
    pub fn attr_timeout(&self) -> Duration {
        Duration::from_millis(self.attr_timeout_ms)
    }

    /// Entry TTL handed to the kernel.
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}
