//! In-memory capability fakes shared by the unit tests

use crate::bootstrap::NodeBootstrapper;
use crate::compute::{async_trait, ComputeApi, InstanceFilter, LoadBalancerApi};
use crate::dns::DnsApi;
use crate::models::{
    ClusterNode, Instance, InstanceState, LaunchRequest, LoadBalancer, PortRange, SecurityGroup,
    TargetGroup, TargetHealth,
};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Ordered record of every mutating call across fakes
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

pub fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn instance(id: &str, name: &str, state: InstanceState, extra: &[(&str, &str)]) -> Instance {
    let mut all = tags(extra);
    all.insert("Name".to_string(), name.to_string());
    Instance {
        id: id.to_string(),
        instance_type: "t3.large".to_string(),
        state,
        private_ip: Some("10.0.0.10".to_string()),
        security_group_ids: Vec::new(),
        tags: all,
    }
}

pub fn security_group(id: &str, cluster: &str, ports: &[u16]) -> SecurityGroup {
    SecurityGroup {
        id: id.to_string(),
        name: id.to_string(),
        tags: tags(&[("Cluster", cluster)]),
        ingress: ports.iter().map(|p| PortRange::single(*p)).collect(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeTargetGroup {
    pub group: TargetGroup,
    pub targets: Vec<TargetHealth>,
}

#[derive(Debug, Clone)]
pub struct FakeLoadBalancer {
    pub lb: LoadBalancer,
    pub tags: HashMap<String, String>,
    pub target_groups: Vec<FakeTargetGroup>,
}

#[derive(Debug, Default)]
pub struct CloudState {
    pub instances: Vec<Instance>,
    pub security_groups: Vec<SecurityGroup>,
    pub load_balancers: Vec<FakeLoadBalancer>,
    /// Operations that fail, e.g. `run_instance` or `register:<tg-arn>`
    pub fail_on: HashSet<String>,
    next_id: u32,
}

/// Compute and load balancer fake
#[derive(Debug, Default)]
pub struct FakeCloud {
    pub state: Mutex<CloudState>,
    pub log: CallLog,
    /// Every describe call, including reads
    pub reads: CallLog,
}

impl FakeCloud {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn with_instance(self, instance: Instance) -> Self {
        self.state.lock().unwrap().instances.push(instance);
        self
    }

    pub fn with_security_group(self, group: SecurityGroup) -> Self {
        self.state.lock().unwrap().security_groups.push(group);
        self
    }

    /// Load balancer without target groups
    pub fn with_load_balancer(self, name: &str, lb_tags: &[(&str, &str)]) -> Self {
        self.state.lock().unwrap().load_balancers.push(FakeLoadBalancer {
            lb: LoadBalancer {
                name: name.to_string(),
                arn: format!("arn:lb/{}", name),
            },
            tags: tags(lb_tags),
            target_groups: Vec::new(),
        });
        self
    }

    /// Target group on an existing load balancer; targets are
    /// `(identity, port, state)`
    pub fn with_target_group(
        self,
        lb_name: &str,
        name: &str,
        port: u16,
        targets: &[(&str, u16, &str)],
    ) -> Self {
        let group = FakeTargetGroup {
            group: TargetGroup {
                name: name.to_string(),
                arn: format!("arn:tg/{}", name),
                port,
            },
            targets: targets
                .iter()
                .map(|(id, port, state)| TargetHealth {
                    id: id.to_string(),
                    port: *port,
                    state: state.to_string(),
                })
                .collect(),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(lb) = state.load_balancers.iter_mut().find(|lb| lb.lb.name == lb_name) {
            lb.target_groups.push(group);
        }
        drop(state);
        self
    }

    pub fn fail_on(&self, operation: &str) {
        self.state.lock().unwrap().fail_on.insert(operation.to_string());
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn targets(&self, tg_arn: &str) -> Vec<TargetHealth> {
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .iter()
            .flat_map(|lb| lb.target_groups.iter())
            .filter(|tg| tg.group.arn == tg_arn)
            .flat_map(|tg| tg.targets.clone())
            .collect()
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_on.contains(operation) {
            bail!("injected failure for {}", operation);
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        self.reads.push(format!("describe_instances {:?}", filter));
        self.check("describe_instances")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .filter(|i| match filter {
                InstanceFilter::Tag { key, value } => i.tag(key) == Some(value.as_str()),
                InstanceFilter::Ids(ids) => ids.contains(&i.id),
                InstanceFilter::SecurityGroups(groups) => {
                    i.security_group_ids.iter().any(|g| groups.contains(g))
                }
                InstanceFilter::NamePrefix(prefix) => {
                    i.name().map(|n| n.starts_with(prefix.as_str())).unwrap_or(false)
                }
            })
            .cloned()
            .collect())
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<Instance> {
        self.check("run_instance")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("i-new{}", state.next_id);
        let instance = Instance {
            id: id.clone(),
            instance_type: request.instance_type.clone(),
            state: InstanceState::Pending,
            private_ip: Some("127.0.0.1".to_string()),
            security_group_ids: request.security_group_ids.clone(),
            tags: request.tags.clone(),
        };
        state.instances.push(instance.clone());
        self.log.push(format!("run_instance {}", request.name));
        Ok(instance)
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        self.check("terminate_instance")?;
        let mut state = self.state.lock().unwrap();
        for instance in state.instances.iter_mut().filter(|i| i.id == id) {
            instance.state = InstanceState::ShuttingDown;
        }
        self.log.push(format!("terminate {}", id));
        Ok(())
    }

    async fn describe_security_groups(&self, key: &str, value: &str) -> Result<Vec<SecurityGroup>> {
        self.reads.push(format!("describe_security_groups {}={}", key, value));
        self.check("describe_security_groups")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .security_groups
            .iter()
            .filter(|g| g.tags.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn tag_instances(&self, ids: &[String], key: &str, value: &str) -> Result<()> {
        self.check("tag_instances")?;
        let mut state = self.state.lock().unwrap();
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.tags.insert(key.to_string(), value.to_string());
        }
        self.log.push(format!("tag {} {}={}", ids.join(","), key, value));
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerApi for FakeCloud {
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        self.reads.push("describe_load_balancers");
        self.check("describe_load_balancers")?;
        let state = self.state.lock().unwrap();
        Ok(state.load_balancers.iter().map(|lb| lb.lb.clone()).collect())
    }

    async fn describe_tags(&self, arn: &str) -> Result<HashMap<String, String>> {
        self.reads.push(format!("describe_tags {}", arn));
        let state = self.state.lock().unwrap();
        Ok(state
            .load_balancers
            .iter()
            .find(|lb| lb.lb.arn == arn)
            .map(|lb| lb.tags.clone())
            .unwrap_or_default())
    }

    async fn describe_target_groups(&self, load_balancer_arn: &str) -> Result<Vec<TargetGroup>> {
        self.reads.push(format!("describe_target_groups {}", load_balancer_arn));
        let state = self.state.lock().unwrap();
        Ok(state
            .load_balancers
            .iter()
            .filter(|lb| lb.lb.arn == load_balancer_arn)
            .flat_map(|lb| lb.target_groups.iter().map(|tg| tg.group.clone()))
            .collect())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        self.reads.push(format!("describe_target_health {}", target_group_arn));
        Ok(self.targets(target_group_arn))
    }

    async fn register_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()> {
        self.check(&format!("register:{}", target_group_arn))?;
        let mut state = self.state.lock().unwrap();
        for tg in state
            .load_balancers
            .iter_mut()
            .flat_map(|lb| lb.target_groups.iter_mut())
            .filter(|tg| tg.group.arn == target_group_arn)
        {
            if !tg.targets.iter().any(|t| t.id == id && t.port == port) {
                tg.targets.push(TargetHealth {
                    id: id.to_string(),
                    port,
                    state: "initial".to_string(),
                });
            }
        }
        self.log.push(format!("register {} {}", target_group_arn, id));
        Ok(())
    }

    async fn deregister_target(&self, target_group_arn: &str, id: &str, port: u16) -> Result<()> {
        self.check(&format!("deregister:{}", target_group_arn))?;
        let mut state = self.state.lock().unwrap();
        for tg in state
            .load_balancers
            .iter_mut()
            .flat_map(|lb| lb.target_groups.iter_mut())
            .filter(|tg| tg.group.arn == target_group_arn)
        {
            tg.targets.retain(|t| !(t.id == id && t.port == port));
        }
        self.log.push(format!("deregister {} {}", target_group_arn, id));
        Ok(())
    }
}

/// DNS fake keyed by fully-qualified record name
#[derive(Debug, Default)]
pub struct FakeDns {
    pub records: Mutex<HashMap<String, String>>,
    pub log: CallLog,
    pub fail: Mutex<bool>,
}

impl FakeDns {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl DnsApi for FakeDns {
    async fn register_node(&self, node: &dyn ClusterNode) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("injected dns failure");
        }
        self.records
            .lock()
            .unwrap()
            .insert(node.fqdn(), node.ip().to_string());
        self.log.push(format!("dns register {}", node.fqdn()));
        Ok(())
    }

    async fn deregister_node(&self, name: &str) -> Result<usize> {
        if *self.fail.lock().unwrap() {
            bail!("injected dns failure");
        }
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|record, _| !record.contains(name));
        self.log.push(format!("dns deregister {}", name));
        Ok(before - records.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedConfig {
    pub address: String,
    pub base: Vec<u8>,
    pub patches: Vec<Vec<u8>>,
    pub insecure: bool,
}

/// Bootstrap fake recording each applied configuration
#[derive(Debug, Default)]
pub struct FakeBootstrap {
    pub applied: Mutex<Vec<AppliedConfig>>,
    pub log: CallLog,
    pub fail: Mutex<bool>,
}

impl FakeBootstrap {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }
}

#[async_trait]
impl NodeBootstrapper for FakeBootstrap {
    async fn apply_configuration(
        &self,
        address: &str,
        base_config: &[u8],
        patches: &[Vec<u8>],
        insecure: bool,
    ) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("injected bootstrap failure");
        }
        self.applied.lock().unwrap().push(AppliedConfig {
            address: address.to_string(),
            base: base_config.to_vec(),
            patches: patches.to_vec(),
            insecure,
        });
        self.log.push(format!("apply_config {}", address));
        Ok(())
    }
}
