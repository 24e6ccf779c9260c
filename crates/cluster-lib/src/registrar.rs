//! Load balancer target registration
//!
//! Decides which of the cluster's target groups a node belongs in and
//! registers or deregisters it. The apiserver load balancer only ever
//! receives control-plane nodes; the other load balancers receive
//! control-plane nodes only when the cluster schedules workloads on them.

use crate::compute::LoadBalancerApi;
use crate::error::{ManagerError, ManagerResult};
use crate::locator::ResourceLocator;
use crate::models::{ClusterNode, LBTargetGroupInfo, LBTargetInfo, NodeRole};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether a node of `role` belongs in a load balancer's target groups
pub fn should_register(is_apiserver: bool, role: NodeRole, schedule_on_cp: bool) -> bool {
    if is_apiserver {
        role.is_control_plane()
    } else {
        !(role.is_control_plane() && !schedule_on_cp)
    }
}

/// Registers nodes into the cluster's load balancer target groups
pub struct LoadBalancerRegistrar {
    locator: Arc<ResourceLocator>,
    load_balancers: Arc<dyn LoadBalancerApi>,
}

impl LoadBalancerRegistrar {
    pub fn new(locator: Arc<ResourceLocator>, load_balancers: Arc<dyn LoadBalancerApi>) -> Self {
        Self {
            locator,
            load_balancers,
        }
    }

    /// Register `node` into every target group it belongs in, on each
    /// group's port. Returns the number of registrations made.
    ///
    /// The first failure aborts the call. Registrations made on earlier
    /// groups stay in place.
    pub async fn register_node(&self, node: &dyn ClusterNode) -> ManagerResult<usize> {
        let config = self.locator.config();
        let lbs = self
            .locator
            .cluster_load_balancers(&config.cluster_name)
            .await?;

        let mut registered = 0;
        for lb in &lbs {
            if !should_register(lb.is_apiserver, node.role(), config.schedule_workloads_on_cp_nodes) {
                debug!(
                    node = %node.name(),
                    role = %node.role(),
                    load_balancer = %lb.name,
                    "Skipping load balancer for role"
                );
                continue;
            }
            for group in &lb.target_groups {
                self.register_target(group, node.identity(), group.port).await?;
                registered += 1;
            }
        }

        info!(
            node = %node.name(),
            identity = %node.identity(),
            registrations = registered,
            "Registered node with load balancers"
        );
        Ok(registered)
    }

    /// Deregister `identity` from every target group of every cluster load
    /// balancer, whether or not it is a member
    pub async fn deregister_node(&self, name: &str, identity: &str) -> ManagerResult<usize> {
        let lbs = self
            .locator
            .cluster_load_balancers(&self.locator.config().cluster_name)
            .await?;

        let mut calls = 0;
        for group in lbs.iter().flat_map(|lb| lb.target_groups.iter()) {
            self.deregister_target(group, identity, group.port).await?;
            calls += 1;
        }

        info!(
            node = %name,
            identity = %identity,
            target_groups = calls,
            "Deregistered node from load balancers"
        );
        Ok(calls)
    }

    pub async fn register_target(
        &self,
        group: &LBTargetGroupInfo,
        identity: &str,
        port: u16,
    ) -> ManagerResult<()> {
        debug!(target_group = %group.name, identity = %identity, port, "Registering target");
        self.load_balancers
            .register_target(&group.reference, identity, port)
            .await
            .map_err(|source| ManagerError::RegistrationFailed {
                target_group: group.name.clone(),
                identity: identity.to_string(),
                source,
            })
    }

    pub async fn deregister_target(
        &self,
        group: &LBTargetGroupInfo,
        identity: &str,
        port: u16,
    ) -> ManagerResult<()> {
        debug!(target_group = %group.name, identity = %identity, port, "Deregistering target");
        self.load_balancers
            .deregister_target(&group.reference, identity, port)
            .await
            .map_err(|source| ManagerError::RegistrationFailed {
                target_group: group.name.clone(),
                identity: identity.to_string(),
                source,
            })
    }

    /// Registered targets of a group, named through the identity cache
    pub async fn get_targets(&self, group: &LBTargetGroupInfo) -> ManagerResult<Vec<LBTargetInfo>> {
        self.locator.targets_for(group).await
    }
}
