//! Data models shared across the lifecycle, locator and reconciler

use crate::error::{ManagerError, ManagerResult};
use crate::names;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Role of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[serde(rename = "controlplane")]
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "controlplane",
            NodeRole::Worker => "worker",
        }
    }

    pub fn is_control_plane(&self) -> bool {
        matches!(self, NodeRole::ControlPlane)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controlplane" | "control-plane" | "cp" => Ok(NodeRole::ControlPlane),
            "worker" => Ok(NodeRole::Worker),
            other => Err(ManagerError::ConfigurationInvalid(format!(
                "unknown node role {other:?}, expected controlplane or worker"
            ))),
        }
    }
}

/// View over a cluster member used by the registrar and DNS capability
pub trait ClusterNode: Send + Sync {
    fn name(&self) -> &str;
    fn role(&self) -> NodeRole;
    /// Private management address
    fn ip(&self) -> &str;
    /// Provider-assigned instance identity
    fn identity(&self) -> &str;
    /// DNS suffix
    fn domain(&self) -> &str;

    fn fqdn(&self) -> String {
        names::fqdn(self.name(), self.domain())
    }
}

/// Transient node value built during create and delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub ip: String,
    pub identity: String,
    pub domain: String,
}

impl ClusterNode for Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> NodeRole {
        self.role
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}

/// Compute shape template for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub image_id: String,
    pub subnet_id: String,
    pub instance_type: String,
    pub block_device_gb: i32,
    #[serde(default = "default_block_device_name")]
    pub block_device_name: String,
    #[serde(default = "default_block_device_type")]
    pub block_device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group_name: Option<String>,
    /// Overrides the cluster domain for this node when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn default_block_device_name() -> String {
    "/dev/xvda".to_string()
}

fn default_block_device_type() -> String {
    "gp3".to_string()
}

impl NodeConfig {
    /// Parse a node config from JSON bytes
    pub fn from_json(bytes: &[u8]) -> ManagerResult<Self> {
        let config: NodeConfig = serde_json::from_slice(bytes)
            .map_err(|e| ManagerError::ConfigurationInvalid(format!("node config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ManagerResult<()> {
        let missing = [
            ("image_id", self.image_id.is_empty()),
            ("subnet_id", self.subnet_id.is_empty()),
            ("instance_type", self.instance_type.is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(ManagerError::ConfigurationInvalid(format!(
                "node config is missing {field}"
            )));
        }
        if self.block_device_gb <= 0 {
            return Err(ManagerError::ConfigurationInvalid(format!(
                "block_device_gb must be positive, got {}",
                self.block_device_gb
            )));
        }
        Ok(())
    }
}

/// Aggregate snapshot returned by describe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub provider: String,
    pub nodes: Vec<NodeInfo>,
    pub load_balancers: Vec<LBInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_daily_cost: Option<f64>,
}

/// One compute instance as seen by the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub identity: String,
    pub instance_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_gib: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cost: Option<f64>,
}

impl NodeInfo {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            name: instance.name().unwrap_or_default().to_string(),
            identity: instance.id.clone(),
            instance_type: instance.instance_type.clone(),
            state: Some(instance.state.as_str().to_string()),
            private_ip: instance.private_ip.clone(),
            ..Default::default()
        }
    }
}

/// A load balancer owned by the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LBInfo {
    pub name: String,
    pub is_apiserver: bool,
    pub target_groups: Vec<LBTargetGroupInfo>,
    pub targets: Vec<LBTargetInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LBTargetGroupInfo {
    pub name: String,
    /// Opaque provider reference (an ARN on AWS)
    pub reference: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LBTargetInfo {
    pub identity: String,
    pub name: String,
    pub port: u16,
    pub state: String,
}

/// Provider instance lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }

    /// Instances in these states no longer count as cluster members
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

/// A compute instance as returned by the compute capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub security_group_ids: Vec<String>,
    pub tags: HashMap<String, String>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.tag("Name")
    }
}

/// Inbound port range of a security group rule. `None` means all ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: Option<u16>,
    pub to: Option<u16>,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            from: Some(port),
            to: Some(port),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from <= port && port <= to,
            (Some(from), None) => from == port,
            (None, Some(to)) => to == port,
            (None, None) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub tags: HashMap<String, String>,
    pub ingress: Vec<PortRange>,
}

impl SecurityGroup {
    pub fn opens_port(&self, port: u16) -> bool {
        self.ingress.iter().any(|range| range.contains(port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub name: String,
    pub arn: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub id: String,
    pub port: u16,
    pub state: String,
}

/// Everything the compute capability needs to launch one node
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub name: String,
    pub image_id: String,
    pub subnet_id: String,
    pub instance_type: String,
    pub block_device_name: String,
    pub block_device_gb: i32,
    pub block_device_type: String,
    pub security_group_ids: Vec<String>,
    pub placement_group_name: Option<String>,
    pub tags: HashMap<String, String>,
}

impl LaunchRequest {
    pub fn new(name: &str, config: &NodeConfig, security_group_ids: Vec<String>) -> Self {
        let mut tags = HashMap::new();
        tags.insert("Name".to_string(), name.to_string());
        Self {
            name: name.to_string(),
            image_id: config.image_id.clone(),
            subnet_id: config.subnet_id.clone(),
            instance_type: config.instance_type.clone(),
            block_device_name: config.block_device_name.clone(),
            block_device_gb: config.block_device_gb,
            block_device_type: config.block_device_type.clone(),
            security_group_ids,
            placement_group_name: config.placement_group_name.clone(),
            tags,
        }
    }
}
