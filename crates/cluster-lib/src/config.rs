//! Cluster manager configuration
//!
//! One explicit struct passed into the locator, lifecycle and reconciler
//! constructors. Loaded from an optional file layered under `KCM_`
//! environment variables.

use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cluster-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,

    #[serde(default = "default_provider")]
    pub provider: String,

    /// DNS suffix of every node
    #[serde(default)]
    pub domain: String,

    /// Register control-plane nodes into ingress target groups too
    #[serde(default)]
    pub schedule_workloads_on_cp_nodes: bool,

    /// Node OS management port, also used to find node security groups
    #[serde(default = "default_management_port")]
    pub management_port: u16,

    #[serde(default = "default_cluster_tag_key")]
    pub cluster_tag_key: String,

    /// Substring identifying the apiserver load balancer by name
    #[serde(default = "default_apiserver_keyword")]
    pub apiserver_keyword: String,

    /// Target health state considered healthy by the monitor
    #[serde(default = "default_healthy_state")]
    pub healthy_state: String,

    #[serde(default)]
    pub dial: DialConfig,

    /// Also treat instances whose `Name` starts with `<cluster>-` as
    /// cluster members. Off by default: prefixes collide across clusters.
    #[serde(default)]
    pub name_prefix_discovery: bool,
}

/// Readiness probe settings for freshly launched nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialConfig {
    #[serde(default = "default_dial_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dial_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_dial_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            max_retries: default_dial_retries(),
            delay_secs: default_dial_delay_secs(),
            timeout_secs: default_dial_timeout_secs(),
        }
    }
}

impl DialConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "aws".to_string()
}

fn default_management_port() -> u16 {
    50000
}

fn default_cluster_tag_key() -> String {
    "Cluster".to_string()
}

fn default_apiserver_keyword() -> String {
    "apiserver".to_string()
}

fn default_healthy_state() -> String {
    "healthy".to_string()
}

fn default_dial_retries() -> u32 {
    150
}

fn default_dial_delay_secs() -> u64 {
    2
}

fn default_dial_timeout_secs() -> u64 {
    300
}

impl ClusterConfig {
    /// Defaults for everything except the cluster name
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            provider: default_provider(),
            domain: String::new(),
            schedule_workloads_on_cp_nodes: false,
            management_port: default_management_port(),
            cluster_tag_key: default_cluster_tag_key(),
            apiserver_keyword: default_apiserver_keyword(),
            healthy_state: default_healthy_state(),
            dial: DialConfig::default(),
            name_prefix_discovery: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Load from an optional file plus `KCM_*` environment variables.
    /// Nested keys use a double underscore, e.g. `KCM_DIAL__MAX_RETRIES`.
    pub fn load(file: Option<&Path>) -> ManagerResult<Self> {
        Self::load_for_cluster(file, None)
    }

    /// Like [`ClusterConfig::load`], with `cluster` taking precedence over
    /// any configured cluster name
    pub fn load_for_cluster(file: Option<&Path>, cluster: Option<&str>) -> ManagerResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("KCM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("cluster_name", cluster)
            .map_err(|e| ManagerError::ConfigurationInvalid(e.to_string()))?
            .build()
            .map_err(|e| ManagerError::ConfigurationInvalid(e.to_string()))?;

        let config: ClusterConfig = settings
            .try_deserialize()
            .map_err(|e| ManagerError::ConfigurationInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ManagerResult<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "cluster_name must not be empty".to_string(),
            ));
        }
        if self.cluster_tag_key.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "cluster_tag_key must not be empty".to_string(),
            ));
        }
        if self.dial.delay_secs == 0 {
            return Err(ManagerError::ConfigurationInvalid(
                "dial.delay_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
