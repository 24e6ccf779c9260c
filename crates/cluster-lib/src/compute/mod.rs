//! Compute and load-balancer capabilities
//!
//! The core only talks to the cloud through these two traits. [`AwsCli`]
//! implements both against the `aws` command line; tests use in-memory
//! fakes.

mod aws_cli;

pub use aws_cli::{AwsCli, AwsCliBuilder};

use crate::models::{Instance, LaunchRequest, LoadBalancer, SecurityGroup, TargetGroup, TargetHealth};
use anyhow::Result;
use std::collections::HashMap;

pub use async_trait::async_trait;

/// Server-side instance filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    /// Exact tag value match
    Tag { key: String, value: String },
    /// Explicit instance identities
    Ids(Vec<String>),
    /// Instances attached to any of these security groups
    SecurityGroups(Vec<String>),
    /// `Name` tag starting with the given prefix
    NamePrefix(String),
}

impl InstanceFilter {
    pub fn tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        InstanceFilter::Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn name(value: impl Into<String>) -> Self {
        Self::tag("Name", value)
    }
}

/// Instance and security group operations
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;

    /// Launch one instance and return it as first reported by the provider
    async fn run_instance(&self, request: &LaunchRequest) -> Result<Instance>;

    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Security groups whose tag `key` equals `value`
    async fn describe_security_groups(&self, key: &str, value: &str) -> Result<Vec<SecurityGroup>>;

    /// Set tag `key=value` on every instance. Re-applying a value is a no-op.
    async fn tag_instances(&self, ids: &[String], key: &str, value: &str) -> Result<()>;
}

/// Load balancer, target group and target operations
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Every load balancer visible to the account. There is no server-side
    /// tag filter for this resource type.
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancer>>;

    async fn describe_tags(&self, arn: &str) -> Result<HashMap<String, String>>;

    async fn describe_target_groups(&self, load_balancer_arn: &str) -> Result<Vec<TargetGroup>>;

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>>;

    async fn register_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()>;

    /// Deregistering a target that is not a member is not an error
    async fn deregister_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()>;
}
