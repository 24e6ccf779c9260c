//! Tag-based discovery of the cloud resources owned by a cluster
//!
//! Ownership is decided only by an exact `Cluster` tag value. Display
//! names are free to contain another cluster's name, so name matching is
//! never used for load balancers or security groups, and for instances
//! only when `name_prefix_discovery` is explicitly enabled.

use crate::compute::{ComputeApi, InstanceFilter, LoadBalancerApi};
use crate::config::ClusterConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::models::{
    ClusterInfo, Instance, InstanceState, LBInfo, LBTargetGroupInfo, LBTargetInfo, NodeInfo,
    SecurityGroup,
};
use crate::pricing::{cluster_daily_cost, instance_specs, CostEstimator};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves instances, security groups, load balancers and targets
pub struct ResourceLocator {
    config: ClusterConfig,
    compute: Arc<dyn ComputeApi>,
    load_balancers: Arc<dyn LoadBalancerApi>,
    /// Memoization only; a miss falls back to a live lookup
    nodes_by_identity: DashMap<String, NodeInfo>,
}

impl ResourceLocator {
    pub fn new(
        config: ClusterConfig,
        compute: Arc<dyn ComputeApi>,
        load_balancers: Arc<dyn LoadBalancerApi>,
    ) -> Self {
        Self {
            config,
            compute,
            load_balancers,
            nodes_by_identity: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Drop memoized lookups. Called at the start of each logical operation.
    pub fn reset_cache(&self) {
        self.nodes_by_identity.clear();
    }

    fn remember(&self, instance: &Instance) -> NodeInfo {
        let info = NodeInfo::from_instance(instance);
        self.nodes_by_identity.insert(info.identity.clone(), info.clone());
        info
    }

    /// Security groups tagged `Cluster=cluster`
    pub async fn resolve_cluster_security_groups(&self, cluster: &str) -> ManagerResult<Vec<SecurityGroup>> {
        let key = &self.config.cluster_tag_key;
        let groups = self
            .compute
            .describe_security_groups(key, cluster)
            .await
            .map_err(|e| ManagerError::backend("describe security groups", cluster, e))?;

        // Re-check client side so a loose provider filter can't leak groups
        Ok(groups
            .into_iter()
            .filter(|g| g.tags.get(key).map(String::as_str) == Some(cluster))
            .collect())
    }

    /// Cluster security groups with an inbound rule covering `port`
    pub async fn resolve_cluster_node_security_groups(
        &self,
        cluster: &str,
        port: u16,
    ) -> ManagerResult<Vec<SecurityGroup>> {
        let groups = self.resolve_cluster_security_groups(cluster).await?;
        Ok(groups.into_iter().filter(|g| g.opens_port(port)).collect())
    }

    /// Live instances tagged `Cluster=cluster`, sorted by name.
    /// Shutting-down and terminated instances are excluded.
    pub async fn cluster_instances(&self, cluster: &str) -> ManagerResult<Vec<Instance>> {
        let key = &self.config.cluster_tag_key;
        let mut instances = self
            .compute
            .describe_instances(&InstanceFilter::tag(key.as_str(), cluster))
            .await
            .map_err(|e| ManagerError::backend("describe instances", cluster, e))?;
        instances.retain(|i| i.tag(key) == Some(cluster));

        if self.config.name_prefix_discovery {
            let prefix = format!("{}-", cluster);
            let by_name = self
                .compute
                .describe_instances(&InstanceFilter::NamePrefix(prefix.clone()))
                .await
                .map_err(|e| ManagerError::backend("describe instances", &prefix, e))?;
            let seen: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();
            instances.extend(
                by_name
                    .into_iter()
                    .filter(|i| !seen.contains(&i.id))
                    .filter(|i| i.name().map(|n| n.starts_with(&prefix)).unwrap_or(false)),
            );
        }

        instances.retain(|i| !i.state.is_gone());
        instances.sort_by(|a, b| a.name().cmp(&b.name()).then_with(|| a.id.cmp(&b.id)));
        for instance in &instances {
            self.remember(instance);
        }
        debug!(cluster = %cluster, count = instances.len(), "Resolved cluster instances");
        Ok(instances)
    }

    /// Live instances attached to the cluster's node security groups that
    /// are not among `members`
    pub async fn untagged_candidates(
        &self,
        cluster: &str,
        members: &[Instance],
    ) -> ManagerResult<Vec<Instance>> {
        let groups = self
            .resolve_cluster_node_security_groups(cluster, self.config.management_port)
            .await?;
        if groups.is_empty() {
            debug!(cluster = %cluster, "No node security groups found");
            return Ok(Vec::new());
        }

        let group_ids: Vec<String> = groups.into_iter().map(|g| g.id).collect();
        let instances = self
            .compute
            .describe_instances(&InstanceFilter::SecurityGroups(group_ids.clone()))
            .await
            .map_err(|e| ManagerError::backend("describe instances", group_ids.join(","), e))?;

        let known: HashSet<&str> = members.iter().map(|i| i.id.as_str()).collect();
        let mut candidates: Vec<Instance> = instances
            .into_iter()
            .filter(|i| !i.state.is_gone())
            .filter(|i| !known.contains(i.id.as_str()))
            .collect();
        candidates.sort_by(|a, b| a.name().cmp(&b.name()).then_with(|| a.id.cmp(&b.id)));
        for candidate in &candidates {
            self.remember(candidate);
        }
        Ok(candidates)
    }

    /// The single running instance whose `Name` tag equals `name`.
    ///
    /// Non-running duplicates are ignored. Zero running instances is
    /// `NotFound`; more than one is `InconsistentState`. Always a live query.
    pub async fn running_node_by_name(&self, name: &str) -> ManagerResult<Instance> {
        let instances = self
            .compute
            .describe_instances(&InstanceFilter::name(name))
            .await
            .map_err(|e| ManagerError::backend("describe instances", name, e))?;

        let total = instances.len();
        let mut running: Vec<Instance> = instances
            .into_iter()
            .filter(|i| i.state == InstanceState::Running && i.name() == Some(name))
            .collect();

        match running.len() {
            0 => {
                debug!(node = %name, candidates = total, "No running instance");
                Err(ManagerError::not_found("running instance", name))
            }
            1 => {
                let instance = running.remove(0);
                self.remember(&instance);
                Ok(instance)
            }
            n => Err(ManagerError::InconsistentState(format!(
                "{} running instances named {}: {}",
                n,
                name,
                running.iter().map(|i| i.id.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Resolve an identity to a node, cache first.
    ///
    /// `None` means the provider does not show the instance to this account.
    pub async fn node_by_identity(&self, identity: &str) -> ManagerResult<Option<NodeInfo>> {
        if let Some(cached) = self.nodes_by_identity.get(identity) {
            return Ok(Some(cached.value().clone()));
        }

        let instances = self
            .compute
            .describe_instances(&InstanceFilter::Ids(vec![identity.to_string()]))
            .await
            .map_err(|e| ManagerError::backend("describe instances", identity, e))?;

        Ok(instances
            .iter()
            .find(|i| i.id == identity)
            .map(|instance| self.remember(instance)))
    }

    /// Registered targets of one target group with display names
    pub async fn targets_for(&self, group: &LBTargetGroupInfo) -> ManagerResult<Vec<LBTargetInfo>> {
        let health = self
            .load_balancers
            .describe_target_health(&group.reference)
            .await
            .map_err(|e| ManagerError::backend("describe target health", &group.name, e))?;

        let mut targets = Vec::with_capacity(health.len());
        for target in health {
            match self.node_by_identity(&target.id).await? {
                Some(node) => targets.push(LBTargetInfo {
                    name: if node.name.is_empty() {
                        target.id.clone()
                    } else {
                        node.name
                    },
                    identity: target.id,
                    port: target.port,
                    state: target.state,
                }),
                None => {
                    warn!(
                        target_group = %group.name,
                        identity = %target.id,
                        "Target not visible to this account, excluding"
                    );
                }
            }
        }
        targets.sort_by(|a, b| a.name.cmp(&b.name).then(a.port.cmp(&b.port)));
        Ok(targets)
    }

    /// Load balancers tagged `Cluster=cluster` with their target groups,
    /// without target lookups
    pub async fn cluster_load_balancers(&self, cluster: &str) -> ManagerResult<Vec<LBInfo>> {
        let key = &self.config.cluster_tag_key;
        let all = self
            .load_balancers
            .describe_load_balancers()
            .await
            .map_err(|e| ManagerError::backend("describe load balancers", cluster, e))?;

        let mut owned = Vec::new();
        for lb in all {
            let tags = self
                .load_balancers
                .describe_tags(&lb.arn)
                .await
                .map_err(|e| ManagerError::backend("describe tags", &lb.name, e))?;
            if tags.get(key).map(String::as_str) != Some(cluster) {
                continue;
            }

            let groups = self
                .load_balancers
                .describe_target_groups(&lb.arn)
                .await
                .map_err(|e| ManagerError::backend("describe target groups", &lb.name, e))?;

            let mut target_groups: Vec<LBTargetGroupInfo> = groups
                .into_iter()
                .map(|tg| LBTargetGroupInfo {
                    name: tg.name,
                    reference: tg.arn,
                    port: tg.port,
                })
                .collect();
            target_groups.sort_by(|a, b| a.name.cmp(&b.name));

            owned.push(LBInfo {
                is_apiserver: lb.name.contains(&self.config.apiserver_keyword),
                name: lb.name,
                target_groups,
                targets: Vec::new(),
            });
        }
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(owned)
    }

    /// Cluster load balancers with every target group's registered targets
    pub async fn resolve_cluster_load_balancers(&self, cluster: &str) -> ManagerResult<Vec<LBInfo>> {
        let mut lbs = self.cluster_load_balancers(cluster).await?;
        for lb in &mut lbs {
            let mut targets = Vec::new();
            for group in &lb.target_groups {
                targets.extend(self.targets_for(group).await?);
            }
            lb.targets = targets;
        }
        debug!(cluster = %cluster, load_balancers = lbs.len(), "Resolved cluster load balancers");
        Ok(lbs)
    }

    /// Fresh snapshot of the cluster's nodes and load balancers
    pub async fn describe_cluster(
        &self,
        cluster: &str,
        estimator: Option<&dyn CostEstimator>,
    ) -> ManagerResult<ClusterInfo> {
        self.reset_cache();

        let instances = self.cluster_instances(cluster).await?;
        let mut nodes: Vec<NodeInfo> = instances.iter().map(NodeInfo::from_instance).collect();
        for node in &mut nodes {
            if let Some(specs) = instance_specs(&node.instance_type) {
                node.vcpus = Some(specs.vcpus);
                node.memory_gib = Some(specs.memory_gib);
            }
            if let Some(estimator) = estimator {
                match estimator.daily_cost(&node.instance_type) {
                    Ok(cost) => node.daily_cost = Some(cost),
                    Err(e) => debug!(node = %node.name, error = %e, "No cost estimate"),
                }
            }
        }

        let load_balancers = self.resolve_cluster_load_balancers(cluster).await?;
        let estimated_daily_cost = estimator.map(|e| cluster_daily_cost(&nodes, e));

        info!(
            cluster = %cluster,
            nodes = nodes.len(),
            load_balancers = load_balancers.len(),
            "Described cluster"
        );
        Ok(ClusterInfo {
            name: cluster.to_string(),
            provider: self.config.provider.clone(),
            nodes,
            load_balancers,
            estimated_daily_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::StaticPricing;
    use crate::testing::{instance, security_group, CallLog, FakeCloud};

    fn locator(cloud: FakeCloud) -> (ResourceLocator, Arc<FakeCloud>) {
        let cloud = Arc::new(cloud);
        let locator = ResourceLocator::new(ClusterConfig::new("alpha"), cloud.clone(), cloud.clone());
        (locator, cloud)
    }

    #[tokio::test]
    async fn test_instances_match_exact_cluster_tag_only() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]))
            .with_instance(instance("i-2", "alpha-beta-cp-1", InstanceState::Running, &[("Cluster", "alpha-beta")]))
            .with_instance(instance("i-3", "alpha-worker-9", InstanceState::Running, &[]))
            .with_instance(instance("i-4", "alpha-worker-1", InstanceState::Terminated, &[("Cluster", "alpha")]));
        let (locator, _) = locator(cloud);

        let instances = locator.cluster_instances("alpha").await.unwrap();
        let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1"]);

        let other = locator.cluster_instances("alpha-beta").await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].id, "i-2");
    }

    #[tokio::test]
    async fn test_name_prefix_discovery_is_opt_in() {
        let cloud = Arc::new(
            FakeCloud::new(CallLog::default())
                .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]))
                .with_instance(instance("i-3", "alpha-worker-9", InstanceState::Running, &[])),
        );
        let mut config = ClusterConfig::new("alpha");
        config.name_prefix_discovery = true;
        let locator = ResourceLocator::new(config, cloud.clone(), cloud.clone());

        let instances = locator.cluster_instances("alpha").await.unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[tokio::test]
    async fn test_node_security_groups_filter_on_port() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_security_group(security_group("sg-nodes", "alpha", &[50000]))
            .with_security_group(security_group("sg-lb", "alpha", &[443, 6443]))
            .with_security_group(security_group("sg-other", "alpha-beta", &[50000]));
        let (locator, _) = locator(cloud);

        let all = locator.resolve_cluster_security_groups("alpha").await.unwrap();
        assert_eq!(all.len(), 2);

        let nodes = locator
            .resolve_cluster_node_security_groups("alpha", 50000)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "sg-nodes");
    }

    #[tokio::test]
    async fn test_running_node_ignores_stopped_duplicates() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-old", "alpha-worker-1", InstanceState::Stopped, &[]))
            .with_instance(instance("i-older", "alpha-worker-1", InstanceState::Terminated, &[]))
            .with_instance(instance("i-new", "alpha-worker-1", InstanceState::Running, &[]));
        let (locator, _) = locator(cloud);

        let node = locator.running_node_by_name("alpha-worker-1").await.unwrap();
        assert_eq!(node.id, "i-new");
    }

    #[tokio::test]
    async fn test_no_running_instance_is_not_found() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-a", "alpha-worker-1", InstanceState::Stopped, &[]))
            .with_instance(instance("i-b", "alpha-worker-1", InstanceState::Stopped, &[]));
        let (locator, _) = locator(cloud);

        let err = locator.running_node_by_name("alpha-worker-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_two_running_instances_is_inconsistent() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-a", "alpha-worker-1", InstanceState::Running, &[]))
            .with_instance(instance("i-b", "alpha-worker-1", InstanceState::Running, &[]));
        let (locator, _) = locator(cloud);

        let err = locator.running_node_by_name("alpha-worker-1").await.unwrap_err();
        assert!(matches!(err, ManagerError::InconsistentState(_)));
    }

    #[tokio::test]
    async fn test_load_balancers_filtered_by_exact_tag() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]))
            .with_instance(instance("i-9", "beta-cp-1", InstanceState::Running, &[("Cluster", "beta")]))
            .with_load_balancer("apiserver-beta", &[("Cluster", "beta")])
            .with_target_group("apiserver-beta", "apiserver-beta", 6443, &[("i-9", 6443, "healthy")])
            .with_load_balancer("apiserver-alpha", &[("Cluster", "alpha")])
            .with_target_group("apiserver-alpha", "apiserver-alpha", 6443, &[("i-1", 6443, "healthy")])
            .with_load_balancer("untagged-alpha", &[]);
        let (locator, _) = locator(cloud);

        let lbs = locator.resolve_cluster_load_balancers("alpha").await.unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].name, "apiserver-alpha");
        assert!(lbs[0].is_apiserver);
        assert_eq!(lbs[0].target_groups.len(), 1);
        assert_eq!(lbs[0].target_groups[0].port, 6443);
        assert_eq!(lbs[0].targets.len(), 1);
        assert_eq!(lbs[0].targets[0].name, "alpha-cp-1");
        assert_eq!(lbs[0].targets[0].state, "healthy");
    }

    #[tokio::test]
    async fn test_empty_target_group_is_kept() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_load_balancer("ingress-alpha", &[("Cluster", "alpha")])
            .with_target_group("ingress-alpha", "ingress-alpha-tls", 30443, &[])
            .with_target_group("ingress-alpha", "ingress-alpha-clear", 30080, &[]);
        let (locator, _) = locator(cloud);

        let lbs = locator.resolve_cluster_load_balancers("alpha").await.unwrap();
        assert_eq!(lbs[0].target_groups.len(), 2);
        assert!(lbs[0].targets.is_empty());
        assert!(!lbs[0].is_apiserver);
    }

    #[tokio::test]
    async fn test_invisible_target_is_excluded() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]))
            .with_load_balancer("apiserver-alpha", &[("Cluster", "alpha")])
            .with_target_group(
                "apiserver-alpha",
                "apiserver-alpha",
                6443,
                &[("i-1", 6443, "healthy"), ("i-gone", 6443, "unused")],
            );
        let (locator, _) = locator(cloud);

        let lbs = locator.resolve_cluster_load_balancers("alpha").await.unwrap();
        assert_eq!(lbs[0].targets.len(), 1);
        assert_eq!(lbs[0].targets[0].identity, "i-1");
    }

    #[tokio::test]
    async fn test_identity_lookup_uses_cache() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]));
        let (locator, cloud) = locator(cloud);

        locator.cluster_instances("alpha").await.unwrap();
        let reads_before = cloud.reads.count("describe_instances");

        let node = locator.node_by_identity("i-1").await.unwrap().unwrap();
        assert_eq!(node.name, "alpha-cp-1");
        assert_eq!(cloud.reads.count("describe_instances"), reads_before);

        locator.reset_cache();
        locator.node_by_identity("i-1").await.unwrap();
        assert_eq!(cloud.reads.count("describe_instances"), reads_before + 1);
    }

    #[tokio::test]
    async fn test_untagged_candidates() {
        let mut tagged = instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]);
        tagged.security_group_ids = vec!["sg-nodes".to_string()];
        let mut untagged = instance("i-2", "alpha-worker-1", InstanceState::Running, &[]);
        untagged.security_group_ids = vec!["sg-nodes".to_string()];
        let mut stray = instance("i-3", "bastion", InstanceState::Running, &[]);
        stray.security_group_ids = vec!["sg-bastion".to_string()];

        let cloud = FakeCloud::new(CallLog::default())
            .with_security_group(security_group("sg-nodes", "alpha", &[50000]))
            .with_instance(tagged)
            .with_instance(untagged)
            .with_instance(stray);
        let (locator, _) = locator(cloud);

        let members = locator.cluster_instances("alpha").await.unwrap();
        let candidates = locator.untagged_candidates("alpha", &members).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "i-2");
    }

    #[tokio::test]
    async fn test_describe_cluster_decorates_costs() {
        let cloud = FakeCloud::new(CallLog::default())
            .with_instance(instance("i-1", "alpha-cp-1", InstanceState::Running, &[("Cluster", "alpha")]))
            .with_instance(instance("i-2", "alpha-worker-1", InstanceState::Running, &[("Cluster", "alpha")]));
        let (locator, _) = locator(cloud);
        let pricing = StaticPricing::new("us-east-1");

        let info = locator.describe_cluster("alpha", Some(&pricing)).await.unwrap();
        assert_eq!(info.provider, "aws");
        assert_eq!(info.nodes.len(), 2);
        assert_eq!(info.nodes[0].name, "alpha-cp-1");
        assert_eq!(info.nodes[0].vcpus, Some(2));
        let total = info.estimated_daily_cost.unwrap();
        assert!((total - 2.0 * 0.0832 * 24.0).abs() < 1e-9);

        let bare = locator.describe_cluster("alpha", None).await.unwrap();
        assert!(bare.estimated_daily_cost.is_none());
        assert!(bare.nodes[0].daily_cost.is_none());
    }
}
