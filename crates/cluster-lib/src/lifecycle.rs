//! Node lifecycle orchestration
//!
//! Create, Delete and Glass as sequential state machines over the compute,
//! bootstrap, load balancer, DNS and Kubernetes capabilities. A failing
//! stage ends the operation immediately. Side effects of the stages that
//! already completed are left in place and named in the returned
//! [`ManagerError::StageFailed`].

use crate::bootstrap::{hostname_patch, NodeBootstrapper};
use crate::compute::{ComputeApi, LoadBalancerApi};
use crate::config::ClusterConfig;
use crate::dialer::dial_with_retry;
use crate::dns::DnsApi;
use crate::error::{ManagerError, ManagerResult, Stage};
use crate::kubernetes::{KubernetesApi, NodeDeletion};
use crate::locator::ResourceLocator;
use crate::models::{ClusterNode, Instance, LaunchRequest, Node, NodeConfig, NodeRole};
use crate::names;
use crate::observability::{ManagerMetrics, StructuredLogger};
use crate::registrar::LoadBalancerRegistrar;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Everything needed to bring up one node
#[derive(Debug, Clone)]
pub struct CreateNodeRequest {
    pub name: String,
    pub role: NodeRole,
    pub node_config: NodeConfig,
    /// Base machine configuration
    pub machine_config: Vec<u8>,
    /// Applied in order after the base configuration
    pub patches: Vec<Vec<u8>>,
}

/// What a successful delete removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedNode {
    pub name: String,
    pub identity: String,
    pub ip: Option<String>,
    pub dns_records_removed: usize,
    pub target_groups_deregistered: usize,
    pub kubernetes: NodeDeletion,
}

/// Completed stages of one operation
struct StageTracker<'a> {
    operation: &'static str,
    node: String,
    completed: Vec<Stage>,
    logger: &'a StructuredLogger,
}

impl<'a> StageTracker<'a> {
    fn new(operation: &'static str, node: &str, logger: &'a StructuredLogger) -> Self {
        Self {
            operation,
            node: node.to_string(),
            completed: Vec::new(),
            logger,
        }
    }

    fn record<T>(&mut self, stage: Stage, result: ManagerResult<T>) -> ManagerResult<T> {
        match result {
            Ok(value) => {
                self.logger.log_stage_completed(self.operation, &self.node, stage);
                self.completed.push(stage);
                Ok(value)
            }
            Err(err) => {
                self.logger
                    .log_stage_failed(self.operation, &self.node, stage, &self.completed, &err);
                Err(ManagerError::StageFailed {
                    node: self.node.clone(),
                    stage,
                    completed: self.completed.clone(),
                    source: Box::new(err),
                })
            }
        }
    }
}

/// Create, delete and replace cluster nodes.
///
/// Operations are not serialized: running two of them against the same
/// node name at once is unsupported and nothing prevents it.
pub struct NodeLifecycle {
    config: ClusterConfig,
    locator: Arc<ResourceLocator>,
    compute: Arc<dyn ComputeApi>,
    registrar: LoadBalancerRegistrar,
    dns: Arc<dyn DnsApi>,
    bootstrap: Arc<dyn NodeBootstrapper>,
    kubernetes: Arc<dyn KubernetesApi>,
    metrics: ManagerMetrics,
    logger: StructuredLogger,
}

impl NodeLifecycle {
    pub fn builder() -> NodeLifecycleBuilder {
        NodeLifecycleBuilder::new()
    }

    pub fn locator(&self) -> &Arc<ResourceLocator> {
        &self.locator
    }

    /// Launch, configure and publish a new node
    pub async fn create(&self, request: &CreateNodeRequest) -> ManagerResult<Node> {
        self.logger.log_operation_started("create", &request.name);
        let result = self.create_node(request).await;
        self.metrics.record_lifecycle("create", result.is_ok());
        if let Ok(node) = &result {
            self.logger
                .log_operation_finished("create", &node.name, &node.identity);
        }
        result
    }

    /// Unpublish and terminate the running instance named `name`
    pub async fn delete(&self, name: &str) -> ManagerResult<DeletedNode> {
        let name = names::short_name(name);
        self.logger.log_operation_started("delete", name);
        let result = self.delete_node(name).await;
        self.metrics.record_lifecycle("delete", result.is_ok());
        if let Ok(deleted) = &result {
            self.logger
                .log_operation_finished("delete", &deleted.name, &deleted.identity);
        }
        result
    }

    /// Delete then create under the same name. If the create fails the
    /// slot stays empty.
    pub async fn glass(&self, request: &CreateNodeRequest) -> ManagerResult<Node> {
        self.logger.log_operation_started("glass", &request.name);
        let result = self.replace_node(request).await;
        self.metrics.record_lifecycle("glass", result.is_ok());
        result
    }

    async fn replace_node(&self, request: &CreateNodeRequest) -> ManagerResult<Node> {
        let deleted = self.delete(&request.name).await?;
        info!(
            node = %deleted.name,
            old_identity = %deleted.identity,
            "Old instance removed, recreating"
        );
        self.create(request).await
    }

    fn domain_for(&self, node_config: &NodeConfig) -> String {
        node_config
            .domain
            .clone()
            .unwrap_or_else(|| self.config.domain.clone())
    }

    fn validate(&self, request: &CreateNodeRequest) -> ManagerResult<()> {
        if request.name.trim().is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "node name must not be empty".to_string(),
            ));
        }
        if request.machine_config.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(format!(
                "machine configuration for {} is empty",
                request.name
            )));
        }
        request.node_config.validate()
    }

    async fn create_node(&self, request: &CreateNodeRequest) -> ManagerResult<Node> {
        self.validate(request)?;
        let mut stages = StageTracker::new("create", &request.name, &self.logger);

        let instance = stages.record(Stage::Launching, self.launch(request).await)?;

        let ip = stages.record(
            Stage::AwaitingReachability,
            self.await_reachability(&instance).await,
        )?;

        let node = Node {
            name: request.name.clone(),
            role: request.role,
            ip,
            identity: instance.id.clone(),
            domain: self.domain_for(&request.node_config),
        };

        stages.record(Stage::ConfiguringOs, self.configure_os(&node, request).await)?;

        stages.record(
            Stage::RegisteringLoadBalancer,
            self.registrar.register_node(&node).await.map(drop),
        )?;

        let dns = self
            .dns
            .register_node(&node)
            .await
            .map_err(|e| ManagerError::backend("register DNS record", node.fqdn(), e));
        stages.record(Stage::RegisteringDns, dns)?;

        Ok(node)
    }

    async fn launch(&self, request: &CreateNodeRequest) -> ManagerResult<Instance> {
        let cluster = &self.config.cluster_name;
        let port = self.config.management_port;
        let groups = self
            .locator
            .resolve_cluster_node_security_groups(cluster, port)
            .await?;
        if groups.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(format!(
                "no security group tagged {}={} opens port {}",
                self.config.cluster_tag_key, cluster, port
            )));
        }

        let launch = LaunchRequest::new(
            &request.name,
            &request.node_config,
            groups.into_iter().map(|g| g.id).collect(),
        );
        let instance = self
            .compute
            .run_instance(&launch)
            .await
            .map_err(|e| ManagerError::backend("run instance", &request.name, e))?;

        info!(
            node = %request.name,
            identity = %instance.id,
            instance_type = %instance.instance_type,
            "Instance launched"
        );
        Ok(instance)
    }

    async fn await_reachability(&self, instance: &Instance) -> ManagerResult<String> {
        let ip = instance.private_ip.clone().ok_or_else(|| {
            ManagerError::InconsistentState(format!(
                "instance {} was launched without a private address",
                instance.id
            ))
        })?;

        let dial = &self.config.dial;
        let endpoint = format!("{}:{}", ip, self.config.management_port);
        let deadline = Instant::now() + dial.timeout();
        let stream = dial_with_retry(&endpoint, dial.max_retries, dial.delay(), deadline).await?;
        drop(stream);
        Ok(ip)
    }

    async fn configure_os(&self, node: &Node, request: &CreateNodeRequest) -> ManagerResult<()> {
        let mut patches = request.patches.clone();
        patches.push(hostname_patch(&node.fqdn()));

        // The node still presents its self-signed maintenance certificate
        self.bootstrap
            .apply_configuration(&node.ip, &request.machine_config, &patches, true)
            .await
            .map_err(|e| ManagerError::backend("apply machine configuration", &node.name, e))
    }

    async fn delete_node(&self, name: &str) -> ManagerResult<DeletedNode> {
        let mut stages = StageTracker::new("delete", name, &self.logger);

        let instance = stages.record(
            Stage::ResolvingIdentity,
            self.locator.running_node_by_name(name).await,
        )?;
        debug!(node = %name, identity = %instance.id, "Resolved running instance");

        let dns = self
            .dns
            .deregister_node(name)
            .await
            .map_err(|e| ManagerError::backend("deregister DNS records", name, e));
        let dns_records_removed = stages.record(Stage::DeregisteringDns, dns)?;

        let target_groups_deregistered = stages.record(
            Stage::DeregisteringLoadBalancer,
            self.registrar.deregister_node(name, &instance.id).await,
        )?;

        let terminate = self
            .compute
            .terminate_instance(&instance.id)
            .await
            .map_err(|e| ManagerError::backend("terminate instance", &instance.id, e));
        stages.record(Stage::Terminating, terminate)?;

        let kubernetes = stages.record(
            Stage::DeletingKubernetesNode,
            self.delete_kubernetes_node(name).await,
        )?;

        Ok(DeletedNode {
            name: name.to_string(),
            identity: instance.id,
            ip: instance.private_ip,
            dns_records_removed,
            target_groups_deregistered,
            kubernetes,
        })
    }

    /// Node objects may be registered under the short or the
    /// fully-qualified name
    async fn delete_kubernetes_node(&self, name: &str) -> ManagerResult<NodeDeletion> {
        let outcome = self
            .kubernetes
            .delete_node(name)
            .await
            .map_err(|e| ManagerError::backend("delete kubernetes node", name, e))?;
        if outcome == NodeDeletion::Deleted || self.config.domain.is_empty() {
            return Ok(outcome);
        }

        let fqdn = names::fqdn(name, &self.config.domain);
        let outcome = self
            .kubernetes
            .delete_node(&fqdn)
            .await
            .map_err(|e| ManagerError::backend("delete kubernetes node", &fqdn, e))?;
        if outcome == NodeDeletion::AlreadyAbsent {
            info!(node = %name, "Kubernetes node object already absent");
        }
        Ok(outcome)
    }
}

/// Builder for [`NodeLifecycle`]
pub struct NodeLifecycleBuilder {
    config: Option<ClusterConfig>,
    compute: Option<Arc<dyn ComputeApi>>,
    load_balancers: Option<Arc<dyn LoadBalancerApi>>,
    dns: Option<Arc<dyn DnsApi>>,
    bootstrap: Option<Arc<dyn NodeBootstrapper>>,
    kubernetes: Option<Arc<dyn KubernetesApi>>,
}

impl NodeLifecycleBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            compute: None,
            load_balancers: None,
            dns: None,
            bootstrap: None,
            kubernetes: None,
        }
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn compute(mut self, compute: Arc<dyn ComputeApi>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn load_balancers(mut self, load_balancers: Arc<dyn LoadBalancerApi>) -> Self {
        self.load_balancers = Some(load_balancers);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn DnsApi>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn bootstrap(mut self, bootstrap: Arc<dyn NodeBootstrapper>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn kubernetes(mut self, kubernetes: Arc<dyn KubernetesApi>) -> Self {
        self.kubernetes = Some(kubernetes);
        self
    }

    pub fn build(self) -> Result<NodeLifecycle> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Cluster config is required"))?;
        config.validate()?;
        let compute = self
            .compute
            .ok_or_else(|| anyhow::anyhow!("Compute capability is required"))?;
        let load_balancers = self
            .load_balancers
            .ok_or_else(|| anyhow::anyhow!("Load balancer capability is required"))?;
        let dns = self
            .dns
            .ok_or_else(|| anyhow::anyhow!("DNS capability is required"))?;
        let bootstrap = self
            .bootstrap
            .ok_or_else(|| anyhow::anyhow!("Bootstrap capability is required"))?;
        let kubernetes = self
            .kubernetes
            .ok_or_else(|| anyhow::anyhow!("Kubernetes capability is required"))?;

        let locator = Arc::new(ResourceLocator::new(
            config.clone(),
            compute.clone(),
            load_balancers.clone(),
        ));
        let registrar = LoadBalancerRegistrar::new(locator.clone(), load_balancers);
        let logger = StructuredLogger::new(config.cluster_name.clone());

        Ok(NodeLifecycle {
            config,
            locator,
            compute,
            registrar,
            dns,
            bootstrap,
            kubernetes,
            metrics: ManagerMetrics::new(),
            logger,
        })
    }
}

impl Default for NodeLifecycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
