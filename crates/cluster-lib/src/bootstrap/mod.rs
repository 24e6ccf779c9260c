//! Node operating system bootstrap capability

mod talosctl;

pub use talosctl::TalosCtl;

use anyhow::Result;

pub use async_trait::async_trait;

#[async_trait]
pub trait NodeBootstrapper: Send + Sync {
    /// Apply a machine configuration plus patches to the node at `address`.
    /// `insecure` skips certificate verification, required while the node
    /// still presents its self-signed maintenance certificate.
    async fn apply_configuration(
        &self,
        address: &str,
        base_config: &[u8],
        patches: &[Vec<u8>],
        insecure: bool,
    ) -> Result<()>;
}

/// Patch setting the node hostname to its fully-qualified name
pub fn hostname_patch(fqdn: &str) -> Vec<u8> {
    format!("machine:\n  network:\n    hostname: {}\n", fqdn).into_bytes()
}
