//! AWS implementation of the compute and load-balancer capabilities
//!
//! Shells out to the `aws` CLI with `--output json`. The CLI paginates
//! listings itself, so every describe call returns the full result set.

use super::{async_trait, ComputeApi, InstanceFilter, LoadBalancerApi};
use crate::models::{
    Instance, InstanceState, LaunchRequest, LoadBalancer, PortRange, SecurityGroup, TargetGroup,
    TargetHealth,
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default timeout for a single aws CLI invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Error code returned when describing identities the account cannot see
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// Compute and ELBv2 client backed by the aws CLI
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    profile: Option<String>,
    region: Option<String>,
    timeout: Duration,
}

/// Builder for [`AwsCli`]
#[derive(Debug, Default)]
pub struct AwsCliBuilder {
    binary: Option<String>,
    profile: Option<String>,
    region: Option<String>,
    timeout: Option<Duration>,
}

impl AwsCliBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> AwsCli {
        AwsCli {
            binary: self.binary.unwrap_or_else(|| "aws".to_string()),
            profile: self.profile,
            region: self.region,
            timeout: self.timeout.unwrap_or(COMMAND_TIMEOUT),
        }
    }
}

impl AwsCli {
    pub fn builder() -> AwsCliBuilder {
        AwsCliBuilder::new()
    }

    /// Run `aws <service> <args> --output json` and return stdout
    async fn run(&self, service: &str, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service).args(args).args(["--output", "json"]);
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }

        let description = format!("aws {} {}", service, args.first().map(String::as_str).unwrap_or(""));
        debug!(command = %description, "Running aws CLI");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", description, self.timeout))?
            .with_context(|| format!("failed to execute {}", description))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %description, error = %stderr, "aws CLI failed");
            bail!("{} failed: {}", description, stderr)
        }
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, service: &str, args: &[String]) -> Result<T> {
        let stdout = self.run(service, args).await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("failed to parse aws {} output", service))
    }
}

fn filter_args(filter: &InstanceFilter) -> Vec<String> {
    match filter {
        InstanceFilter::Tag { key, value } => vec![
            "--filters".to_string(),
            format!("Name=tag:{},Values={}", key, value),
        ],
        InstanceFilter::Ids(ids) => {
            let mut args = vec!["--instance-ids".to_string()];
            args.extend(ids.iter().cloned());
            args
        }
        InstanceFilter::SecurityGroups(ids) => vec![
            "--filters".to_string(),
            format!("Name=instance.group-id,Values={}", ids.join(",")),
        ],
        InstanceFilter::NamePrefix(prefix) => vec![
            "--filters".to_string(),
            format!("Name=tag:Name,Values={}*", prefix),
        ],
    }
}

fn launch_args(request: &LaunchRequest) -> Vec<String> {
    let block_devices = json!([{
        "DeviceName": request.block_device_name,
        "Ebs": {
            "VolumeSize": request.block_device_gb,
            "VolumeType": request.block_device_type,
            "DeleteOnTermination": true,
        }
    }]);
    let mut tags: Vec<_> = request
        .tags
        .iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    tags.sort_by_key(|t| t["Key"].as_str().map(str::to_string));
    let tag_specs = json!([{ "ResourceType": "instance", "Tags": tags }]);

    let mut args = vec![
        "run-instances".to_string(),
        "--count".to_string(),
        "1".to_string(),
        "--image-id".to_string(),
        request.image_id.clone(),
        "--instance-type".to_string(),
        request.instance_type.clone(),
        "--subnet-id".to_string(),
        request.subnet_id.clone(),
        "--block-device-mappings".to_string(),
        block_devices.to_string(),
        "--tag-specifications".to_string(),
        tag_specs.to_string(),
    ];
    if !request.security_group_ids.is_empty() {
        args.push("--security-group-ids".to_string());
        args.extend(request.security_group_ids.iter().cloned());
    }
    if let Some(group) = &request.placement_group_name {
        args.push("--placement".to_string());
        args.push(format!("GroupName={}", group));
    }
    args
}

#[async_trait]
impl ComputeApi for AwsCli {
    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        let mut args = vec!["describe-instances".to_string()];
        args.extend(filter_args(filter));

        match self.run_json::<DescribeInstancesOutput>("ec2", &args).await {
            Ok(output) => Ok(output.into_instances()),
            Err(e) if matches!(filter, InstanceFilter::Ids(_)) && e.to_string().contains(INSTANCE_NOT_FOUND) => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<Instance> {
        let output: RunInstancesOutput = self.run_json("ec2", &launch_args(request)).await?;
        output
            .instances
            .into_iter()
            .next()
            .map(Instance::from)
            .context("run-instances returned no instance")
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        let args = vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ];
        self.run("ec2", &args).await.map(|_| ())
    }

    async fn describe_security_groups(&self, key: &str, value: &str) -> Result<Vec<SecurityGroup>> {
        let args = vec![
            "describe-security-groups".to_string(),
            "--filters".to_string(),
            format!("Name=tag:{},Values={}", key, value),
        ];
        let output: DescribeSecurityGroupsOutput = self.run_json("ec2", &args).await?;
        Ok(output.security_groups.into_iter().map(SecurityGroup::from).collect())
    }

    async fn tag_instances(&self, ids: &[String], key: &str, value: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["create-tags".to_string(), "--resources".to_string()];
        args.extend(ids.iter().cloned());
        args.push("--tags".to_string());
        args.push(format!("Key={},Value={}", key, value));
        self.run("ec2", &args).await.map(|_| ())
    }
}

#[async_trait]
impl LoadBalancerApi for AwsCli {
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        let args = vec!["describe-load-balancers".to_string()];
        let output: DescribeLoadBalancersOutput = self.run_json("elbv2", &args).await?;
        Ok(output
            .load_balancers
            .into_iter()
            .map(|lb| LoadBalancer {
                name: lb.load_balancer_name,
                arn: lb.load_balancer_arn,
            })
            .collect())
    }

    async fn describe_tags(&self, arn: &str) -> Result<HashMap<String, String>> {
        let args = vec![
            "describe-tags".to_string(),
            "--resource-arns".to_string(),
            arn.to_string(),
        ];
        let output: DescribeTagsOutput = self.run_json("elbv2", &args).await?;
        Ok(output
            .tag_descriptions
            .into_iter()
            .filter(|d| d.resource_arn == arn)
            .flat_map(|d| d.tags)
            .map(|t| (t.key, t.value))
            .collect())
    }

    async fn describe_target_groups(&self, load_balancer_arn: &str) -> Result<Vec<TargetGroup>> {
        let args = vec![
            "describe-target-groups".to_string(),
            "--load-balancer-arn".to_string(),
            load_balancer_arn.to_string(),
        ];
        let output: DescribeTargetGroupsOutput = self.run_json("elbv2", &args).await?;
        Ok(output
            .target_groups
            .into_iter()
            .map(|tg| TargetGroup {
                name: tg.target_group_name,
                arn: tg.target_group_arn,
                port: tg.port.unwrap_or_default(),
            })
            .collect())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        let args = vec![
            "describe-target-health".to_string(),
            "--target-group-arn".to_string(),
            target_group_arn.to_string(),
        ];
        let output: DescribeTargetHealthOutput = self.run_json("elbv2", &args).await?;
        Ok(output
            .target_health_descriptions
            .into_iter()
            .map(|d| TargetHealth {
                id: d.target.id,
                port: d.target.port.unwrap_or_default(),
                state: d.target_health.state,
            })
            .collect())
    }

    async fn register_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()> {
        let args = vec![
            "register-targets".to_string(),
            "--target-group-arn".to_string(),
            target_group_arn.to_string(),
            "--targets".to_string(),
            format!("Id={},Port={}", id, port),
        ];
        self.run("elbv2", &args).await.map(|_| ())
    }

    async fn deregister_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()> {
        let args = vec![
            "deregister-targets".to_string(),
            "--target-group-arn".to_string(),
            target_group_arn.to_string(),
            "--targets".to_string(),
            format!("Id={},Port={}", id, port),
        ];
        self.run("elbv2", &args).await.map(|_| ())
    }
}

// aws CLI response shapes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

fn tags_to_map(tags: Vec<Tag>) -> HashMap<String, String> {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

impl DescribeInstancesOutput {
    fn into_instances(self) -> Vec<Instance> {
        self.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(Instance::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    state: Ec2InstanceState,
    private_ip_address: Option<String>,
    #[serde(default)]
    security_groups: Vec<GroupIdentifier>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2InstanceState {
    name: InstanceState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupIdentifier {
    group_id: String,
}

impl From<Ec2Instance> for Instance {
    fn from(i: Ec2Instance) -> Self {
        Instance {
            id: i.instance_id,
            instance_type: i.instance_type,
            state: i.state.name,
            private_ip: i.private_ip_address,
            security_group_ids: i.security_groups.into_iter().map(|g| g.group_id).collect(),
            tags: tags_to_map(i.tags),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroupsOutput {
    #[serde(default)]
    security_groups: Vec<Ec2SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2SecurityGroup {
    group_id: String,
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    ip_permissions: Vec<IpPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpPermission {
    from_port: Option<i32>,
    to_port: Option<i32>,
    #[serde(default)]
    ip_protocol: String,
}

impl IpPermission {
    /// The TCP ports this rule opens. Other protocols open none.
    fn tcp_range(&self) -> Option<PortRange> {
        match self.ip_protocol.as_str() {
            // Protocol "-1" opens every port and carries no range
            "-1" => Some(PortRange { from: None, to: None }),
            "tcp" | "6" => {
                let from = u16::try_from(self.from_port?).ok()?;
                let to = u16::try_from(self.to_port?).ok()?;
                Some(PortRange {
                    from: Some(from),
                    to: Some(to),
                })
            }
            _ => None,
        }
    }
}

impl From<Ec2SecurityGroup> for SecurityGroup {
    fn from(sg: Ec2SecurityGroup) -> Self {
        let ingress = sg
            .ip_permissions
            .iter()
            .filter_map(IpPermission::tcp_range)
            .collect();
        SecurityGroup {
            id: sg.group_id,
            name: sg.group_name,
            tags: tags_to_map(sg.tags),
            ingress,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeLoadBalancersOutput {
    #[serde(default)]
    load_balancers: Vec<ElbLoadBalancer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ElbLoadBalancer {
    load_balancer_name: String,
    load_balancer_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTagsOutput {
    #[serde(default)]
    tag_descriptions: Vec<TagDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagDescription {
    resource_arn: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetGroupsOutput {
    #[serde(default)]
    target_groups: Vec<ElbTargetGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ElbTargetGroup {
    target_group_name: String,
    target_group_arn: String,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetHealthOutput {
    #[serde(default)]
    target_health_descriptions: Vec<TargetHealthDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetHealthDescription {
    target: ElbTarget,
    target_health: ElbTargetHealth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ElbTarget {
    id: String,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ElbTargetHealth {
    state: String,
}
