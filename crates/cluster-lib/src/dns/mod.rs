//! DNS capability
//!
//! Two operations: publish a node's A record and remove every record
//! belonging to a node name.

mod cloudflare;

pub use cloudflare::{CloudflareDns, DEFAULT_CLOUDFLARE_API};

use crate::models::ClusterNode;
use anyhow::Result;

pub use async_trait::async_trait;

#[async_trait]
pub trait DnsApi: Send + Sync {
    /// Create or overwrite the A record `node.name.node.domain -> node.ip`
    async fn register_node(&self, node: &dyn ClusterNode) -> Result<()>;

    /// Delete every record whose name contains `name`. Returns how many
    /// were removed; zero is not an error.
    async fn deregister_node(&self, name: &str) -> Result<usize>;
}
