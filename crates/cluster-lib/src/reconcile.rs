//! Drift detection across compute, Kubernetes and load balancer state
//!
//! One run takes a snapshot of the three systems and derives five
//! independent discrepancy sets from it. Names are compared in their
//! short form because Kubernetes and load balancer targets may carry the
//! fully-qualified name. The only automated repair is tagging instances
//! that are missing the cluster ownership tag.

use crate::compute::ComputeApi;
use crate::error::{ManagerError, ManagerResult};
use crate::kubernetes::KubernetesApi;
use crate::locator::ResourceLocator;
use crate::models::{Instance, LBInfo};
use crate::names::short_name;
use crate::observability::ManagerMetrics;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// An instance named in the report
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceRef {
    pub name: String,
    pub identity: String,
    pub instance_type: String,
}

impl From<&Instance> for InstanceRef {
    fn from(instance: &Instance) -> Self {
        Self {
            name: instance.name().unwrap_or(instance.id.as_str()).to_string(),
            identity: instance.id.clone(),
            instance_type: instance.instance_type.clone(),
        }
    }
}

/// Raw sets a report is derived from
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservedState {
    /// Instances carrying the cluster tag
    pub ec2_nodes: Vec<InstanceRef>,
    /// Instances in the node security groups without the cluster tag
    pub untagged_candidates: Vec<InstanceRef>,
    /// Node object names as Kubernetes reports them
    pub k8s_nodes: Vec<String>,
    /// Display names of every registered target
    pub lb_targets: Vec<String>,
    pub load_balancers: Vec<LBInfo>,
}

/// Five discrepancy classes computed from one snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub cluster: String,
    pub observed: ObservedState,
    pub missing_cluster_tag: BTreeSet<InstanceRef>,
    pub not_in_k8s: BTreeSet<String>,
    pub not_in_ec2: BTreeSet<String>,
    pub not_in_lb: BTreeSet<String>,
    pub lb_without_ec2: BTreeSet<String>,
}

impl ReconciliationReport {
    /// Derive the discrepancy sets. Input order does not matter.
    pub fn compute(cluster: impl Into<String>, observed: ObservedState) -> Self {
        let ec2_ids: HashSet<&str> = observed
            .ec2_nodes
            .iter()
            .map(|i| i.identity.as_str())
            .collect();
        let ec2: HashSet<&str> = observed
            .ec2_nodes
            .iter()
            .map(|i| short_name(&i.name))
            .collect();
        let k8s: HashSet<&str> = observed.k8s_nodes.iter().map(|n| short_name(n)).collect();
        let lb: HashSet<&str> = observed.lb_targets.iter().map(|n| short_name(n)).collect();

        let missing_cluster_tag = observed
            .untagged_candidates
            .iter()
            .filter(|i| !ec2_ids.contains(i.identity.as_str()))
            .cloned()
            .collect();

        let not_in_k8s = absent_from(&ec2, &k8s);
        let not_in_ec2 = absent_from(&k8s, &ec2);
        let not_in_lb = absent_from(&ec2, &lb);
        let lb_without_ec2 = absent_from(&lb, &ec2);

        Self {
            cluster: cluster.into(),
            missing_cluster_tag,
            not_in_k8s,
            not_in_ec2,
            not_in_lb,
            lb_without_ec2,
            observed,
        }
    }

    /// Total entries across the five classes
    pub fn discrepancy_count(&self) -> usize {
        self.missing_cluster_tag.len()
            + self.not_in_k8s.len()
            + self.not_in_ec2.len()
            + self.not_in_lb.len()
            + self.lb_without_ec2.len()
    }

    pub fn is_clean(&self) -> bool {
        self.discrepancy_count() == 0
    }

    /// Identities to pass to [`Reconciler::fix_missing_cluster_tags`]
    pub fn missing_tag_identities(&self) -> Vec<String> {
        self.missing_cluster_tag
            .iter()
            .map(|i| i.identity.clone())
            .collect()
    }

    /// `(class, count)` for every class, in report order
    pub fn class_counts(&self) -> [(&'static str, usize); 5] {
        [
            ("missing_cluster_tag", self.missing_cluster_tag.len()),
            ("not_in_k8s", self.not_in_k8s.len()),
            ("not_in_ec2", self.not_in_ec2.len()),
            ("not_in_lb", self.not_in_lb.len()),
            ("lb_without_ec2", self.lb_without_ec2.len()),
        ]
    }
}

/// Names in `names` that `from` lacks
fn absent_from(names: &HashSet<&str>, from: &HashSet<&str>) -> BTreeSet<String> {
    names
        .iter()
        .filter(|n| !from.contains(*n))
        .map(|n| n.to_string())
        .collect()
}

fn write_names(f: &mut fmt::Formatter<'_>, heading: &str, names: &BTreeSet<String>) -> fmt::Result {
    if names.is_empty() {
        return Ok(());
    }
    writeln!(f)?;
    writeln!(f, "⚠ {}: {}", heading, names.len())?;
    for name in names {
        writeln!(f, "  - {}", name)?;
    }
    Ok(())
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cluster: {}", self.cluster)?;
        writeln!(
            f,
            "EC2 Instances: {}, Kubernetes Nodes: {}, LB Targets: {}",
            self.observed.ec2_nodes.len(),
            self.observed.k8s_nodes.len(),
            self.observed.lb_targets.len()
        )?;

        if self.is_clean() {
            writeln!(f)?;
            return writeln!(f, "✓ No discrepancies found");
        }

        if !self.missing_cluster_tag.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "⚠ Instances Missing Cluster Tag: {}",
                self.missing_cluster_tag.len()
            )?;
            for instance in &self.missing_cluster_tag {
                writeln!(
                    f,
                    "  - {} ({}) {}",
                    instance.name, instance.identity, instance.instance_type
                )?;
            }
        }
        write_names(f, "EC2 Instances Not in Kubernetes", &self.not_in_k8s)?;
        write_names(f, "Kubernetes Nodes Not in EC2", &self.not_in_ec2)?;
        write_names(f, "EC2 Instances Not in Any Load Balancer", &self.not_in_lb)?;
        write_names(f, "Load Balancer Targets Not in EC2", &self.lb_without_ec2)
    }
}

/// Compares the cluster's compute, Kubernetes and load balancer state
pub struct Reconciler {
    locator: Arc<ResourceLocator>,
    compute: Arc<dyn ComputeApi>,
    kubernetes: Arc<dyn KubernetesApi>,
    metrics: ManagerMetrics,
}

impl Reconciler {
    pub fn new(
        locator: Arc<ResourceLocator>,
        compute: Arc<dyn ComputeApi>,
        kubernetes: Arc<dyn KubernetesApi>,
    ) -> Self {
        Self {
            locator,
            compute,
            kubernetes,
            metrics: ManagerMetrics::new(),
        }
    }

    pub fn locator(&self) -> &Arc<ResourceLocator> {
        &self.locator
    }

    /// Snapshot the three systems and compare them. The first data source
    /// that fails aborts the run.
    pub async fn reconcile(&self, cluster: &str) -> ManagerResult<ReconciliationReport> {
        let start = Instant::now();
        self.locator.reset_cache();

        let instances = self.locator.cluster_instances(cluster).await?;
        let candidates = self.locator.untagged_candidates(cluster, &instances).await?;
        let k8s_nodes = self
            .kubernetes
            .list_nodes()
            .await
            .map_err(|e| ManagerError::backend("list kubernetes nodes", cluster, e))?;
        let load_balancers = self.locator.resolve_cluster_load_balancers(cluster).await?;

        let lb_targets = load_balancers
            .iter()
            .flat_map(|lb| lb.targets.iter().map(|t| t.name.clone()))
            .collect();
        let observed = ObservedState {
            ec2_nodes: instances.iter().map(InstanceRef::from).collect(),
            untagged_candidates: candidates.iter().map(InstanceRef::from).collect(),
            k8s_nodes,
            lb_targets,
            load_balancers,
        };

        let report = ReconciliationReport::compute(cluster, observed);
        self.metrics
            .observe_reconcile_duration(start.elapsed().as_secs_f64());
        info!(
            cluster = %cluster,
            discrepancies = report.discrepancy_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Set the cluster tag on each identity. Tagging an already tagged
    /// instance changes nothing.
    pub async fn fix_missing_cluster_tags(&self, identities: &[String]) -> ManagerResult<usize> {
        if identities.is_empty() {
            return Ok(0);
        }
        let config = self.locator.config();
        self.compute
            .tag_instances(identities, &config.cluster_tag_key, &config.cluster_name)
            .await
            .map_err(|e| ManagerError::backend("tag instances", identities.join(","), e))?;

        info!(
            cluster = %config.cluster_name,
            instances = identities.len(),
            "Added cluster tag"
        );
        Ok(identities.len())
    }
}
