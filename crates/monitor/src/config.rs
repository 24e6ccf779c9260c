//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Monitor daemon settings, read from `MONITOR_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between health checks
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Cluster configuration file; `KCM_*` variables apply on top
    #[serde(default)]
    pub cluster_config_file: Option<PathBuf>,

    #[serde(default)]
    pub aws_profile: Option<String>,

    #[serde(default)]
    pub aws_region: Option<String>,

    /// Kubeconfig path; default resolution when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_interval() -> u64 {
    60
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            interval_secs: default_interval(),
            cluster_config_file: None,
            aws_profile: None,
            aws_region: None,
            kubeconfig: None,
        }
    }
}

impl MonitorSettings {
    /// Load settings from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MONITOR"))
            .build()
            .context("Failed to read monitor settings")?;

        let settings: MonitorSettings = config
            .try_deserialize()
            .context("Invalid monitor settings")?;
        if settings.interval_secs == 0 {
            anyhow::bail!("MONITOR_INTERVAL_SECS must be positive");
        }
        Ok(settings)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
