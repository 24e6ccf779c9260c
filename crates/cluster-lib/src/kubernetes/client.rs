//! kube-rs backed implementation of [`KubernetesApi`]

use super::{async_trait, KubernetesApi, NodeDeletion};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::Path;
use tracing::{debug, info};

/// Label and taint key used to dedicate nodes to a workload class
pub const PURPOSE_KEY: &str = "purpose";

const NO_SCHEDULE: &str = "NoSchedule";

/// Cluster-scoped node API
#[derive(Clone)]
pub struct KubeNodes {
    nodes: Api<Node>,
}

impl KubeNodes {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }

    /// Connect using an explicit kubeconfig, or the default resolution
    /// (`KUBECONFIG`, `~/.kube/config`, in-cluster) when `None`
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .context("Failed to load kubeconfig")?;
                Client::try_from(config).context("Failed to create Kubernetes client")?
            }
            None => Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?,
        };
        Ok(Self::new(client))
    }
}

/// Add the purpose label and NoSchedule taint. Returns false when the node
/// already carried both.
pub fn apply_purpose_to(node: &mut Node, purpose: &str) -> bool {
    let mut changed = false;

    let labels = node.metadata.labels.get_or_insert_with(Default::default);
    if labels.get(PURPOSE_KEY).map(String::as_str) != Some(purpose) {
        labels.insert(PURPOSE_KEY.to_string(), purpose.to_string());
        changed = true;
    }

    let spec = node.spec.get_or_insert_with(NodeSpec::default);
    let taints = spec.taints.get_or_insert_with(Vec::new);
    let present = taints.iter().any(|t| {
        t.key == PURPOSE_KEY && t.value.as_deref() == Some(purpose) && t.effect == NO_SCHEDULE
    });
    if !present {
        taints.push(Taint {
            key: PURPOSE_KEY.to_string(),
            value: Some(purpose.to_string()),
            effect: NO_SCHEDULE.to_string(),
            time_added: None,
        });
        changed = true;
    }

    changed
}

#[async_trait]
impl KubernetesApi for KubeNodes {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        let list = self
            .nodes
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    async fn delete_node(&self, name: &str) -> Result<NodeDeletion> {
        match self.nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = %name, "Deleted Kubernetes node");
                Ok(NodeDeletion::Deleted)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(node = %name, "Kubernetes node already absent");
                Ok(NodeDeletion::AlreadyAbsent)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete node {}", name)),
        }
    }

    async fn apply_purpose(&self, name: &str, purpose: &str) -> Result<()> {
        let mut node = self
            .nodes
            .get(name)
            .await
            .with_context(|| format!("Failed to get node {}", name))?;

        if !apply_purpose_to(&mut node, purpose) {
            debug!(node = %name, purpose = %purpose, "Purpose already applied");
            return Ok(());
        }

        self.nodes
            .replace(name, &PostParams::default(), &node)
            .await
            .with_context(|| format!("Failed to update node {}", name))?;
        info!(node = %name, purpose = %purpose, "Applied purpose label and taint");
        Ok(())
    }
}
