//! Node naming
//!
//! Kubernetes and load balancer targets may carry fully-qualified names
//! while the compute `Name` tag uses the short form, so every cross-system
//! comparison goes through [`short_name`].

use crate::models::NodeRole;

/// Strip the DNS domain suffix: everything from the first `.` onwards
pub fn short_name(name: &str) -> &str {
    match name.split_once('.') {
        Some((short, _)) => short,
        None => name,
    }
}

/// `name.domain`, leaving names that already carry the domain untouched
pub fn fqdn(name: &str, domain: &str) -> String {
    let domain = domain.trim_matches('.');
    if domain.is_empty() || name.ends_with(&format!(".{domain}")) {
        name.to_string()
    } else {
        format!("{name}.{domain}")
    }
}

/// Conventional node slot name, e.g. `alpha-cp-1` or `alpha-worker-3`
pub fn node_name(cluster: &str, role: NodeRole, index: u32) -> String {
    match role {
        NodeRole::ControlPlane => format!("{cluster}-cp-{index}"),
        NodeRole::Worker => format!("{cluster}-worker-{index}"),
    }
}
