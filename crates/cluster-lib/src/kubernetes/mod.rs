//! Kubernetes node capability

mod client;

pub use client::{apply_purpose_to, KubeNodes, PURPOSE_KEY};

use anyhow::Result;
use serde::Serialize;
#[cfg(test)]
use mockall::automock;

pub use async_trait::async_trait;

/// Outcome of deleting a node object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeletion {
    Deleted,
    AlreadyAbsent,
}

/// Node object operations used by delete, reconcile and purpose marking
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// Names of every node object
    async fn list_nodes(&self) -> Result<Vec<String>>;

    /// Delete a node object. A missing object is reported, not an error.
    async fn delete_node(&self, name: &str) -> Result<NodeDeletion>;

    /// Label the node `purpose=<value>` and taint it `purpose=<value>:NoSchedule`
    async fn apply_purpose(&self, name: &str, purpose: &str) -> Result<()>;
}
