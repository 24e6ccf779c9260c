//! Command implementations

pub mod cluster;
pub mod node;

use crate::config::Config;
use crate::GlobalArgs;
use anyhow::{Context, Result};
use cluster_lib::{
    compute::{AwsCli, ComputeApi, LoadBalancerApi},
    kubernetes::{KubeNodes, KubernetesApi},
    ClusterConfig, ResourceLocator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Region assumed for price estimates when none is configured
const DEFAULT_REGION: &str = "us-east-1";

/// Resolved cluster configuration and provider clients for one invocation
pub struct ClusterContext {
    pub config: ClusterConfig,
    compute: Arc<dyn ComputeApi>,
    load_balancers: Arc<dyn LoadBalancerApi>,
    region: Option<String>,
    kubeconfig: Option<PathBuf>,
}

impl ClusterContext {
    pub fn new(global: &GlobalArgs, defaults: &Config) -> Result<Self> {
        let cluster = global
            .cluster
            .as_deref()
            .or(defaults.default_cluster.as_deref());
        let config_file = global
            .config
            .as_deref()
            .or(defaults.cluster_config_file.as_deref());

        let config = ClusterConfig::load_for_cluster(config_file, cluster)
            .context("Failed to load cluster configuration (set --cluster or KCM_CLUSTER)")?;
        debug!(cluster = %config.cluster_name, domain = %config.domain, "Loaded cluster configuration");

        let aws = Arc::new(
            AwsCli::builder()
                .profile(global.profile.clone())
                .region(global.region.clone())
                .build(),
        );

        Ok(Self {
            config,
            compute: aws.clone(),
            load_balancers: aws,
            region: global.region.clone(),
            kubeconfig: global.kubeconfig.clone(),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn compute(&self) -> Arc<dyn ComputeApi> {
        self.compute.clone()
    }

    pub fn load_balancers(&self) -> Arc<dyn LoadBalancerApi> {
        self.load_balancers.clone()
    }

    pub fn locator(&self) -> Arc<ResourceLocator> {
        Arc::new(ResourceLocator::new(
            self.config.clone(),
            self.compute(),
            self.load_balancers(),
        ))
    }

    pub async fn kubernetes(&self) -> Result<Arc<dyn KubernetesApi>> {
        let nodes = KubeNodes::connect(self.kubeconfig.as_deref()).await?;
        Ok(Arc::new(nodes))
    }
}
