//! User defaults for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Defaults read from `~/.config/kcm/config.json`; flags and their
/// environment variables take precedence
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Cluster used when `--cluster` is not given
    pub default_cluster: Option<String>,
    /// Cluster configuration file used when `--config` is not given
    pub cluster_config_file: Option<PathBuf>,
    /// Vault KV v2 mount holding node bundles
    pub secret_mount: Option<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("kcm").join("config.json"))
    }
}
