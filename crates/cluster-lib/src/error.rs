//! Error taxonomy for node lifecycle and reconciliation operations
//!
//! Capability adapters return `anyhow::Result`; the core wraps those into
//! [`ManagerError`] variants annotated with the operation and the target
//! resource so an operator can tell what was attempted against what.

use std::fmt;
use thiserror::Error;

/// Result alias used by every core operation
pub type ManagerResult<T> = Result<T, ManagerError>;

/// A stage of the node create/delete state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Launching,
    AwaitingReachability,
    ConfiguringOs,
    RegisteringLoadBalancer,
    RegisteringDns,
    ResolvingIdentity,
    DeregisteringDns,
    DeregisteringLoadBalancer,
    Terminating,
    DeletingKubernetesNode,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Launching => "launching",
            Stage::AwaitingReachability => "awaiting_reachability",
            Stage::ConfiguringOs => "configuring_os",
            Stage::RegisteringLoadBalancer => "registering_load_balancer",
            Stage::RegisteringDns => "registering_dns",
            Stage::ResolvingIdentity => "resolving_identity",
            Stage::DeregisteringDns => "deregistering_dns",
            Stage::DeregisteringLoadBalancer => "deregistering_load_balancer",
            Stage::Terminating => "terminating",
            Stage::DeletingKubernetesNode => "deleting_kubernetes_node",
        }
    }

    /// Human readable description of the side effect left behind once
    /// this stage has completed
    fn residue(&self) -> Option<&'static str> {
        match self {
            Stage::Launching => Some("instance launched"),
            Stage::ConfiguringOs => Some("machine configuration applied"),
            Stage::RegisteringLoadBalancer => Some("load balancer targets registered"),
            Stage::RegisteringDns => Some("DNS record created"),
            Stage::DeregisteringDns => Some("DNS records removed"),
            Stage::DeregisteringLoadBalancer => Some("load balancer targets deregistered"),
            Stage::Terminating => Some("instance terminated"),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the cluster manager core
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Node, instance or record absent
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Every dial attempt failed
    #[error("failed to dial {endpoint} after {attempts} attempts: {source}")]
    DialExhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The deadline passed before the endpoint became reachable
    #[error("dialing {endpoint} cancelled by deadline after {attempts} attempts")]
    Cancelled { endpoint: String, attempts: u32 },

    /// An external capability call failed
    #[error("{operation} failed for {target}: {source:#}")]
    Backend {
        operation: &'static str,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Target group registration or deregistration failed
    #[error("target group {target_group} rejected {identity}: {source:#}")]
    RegistrationFailed {
        target_group: String,
        identity: String,
        #[source]
        source: anyhow::Error,
    },

    /// Provider returned an ambiguous answer
    #[error("inconsistent provider state: {0}")]
    InconsistentState(String),

    /// A lifecycle stage failed after earlier stages had side effects
    #[error("{}", stage_failure_message(node, *stage, completed, source))]
    StageFailed {
        node: String,
        stage: Stage,
        completed: Vec<Stage>,
        #[source]
        source: Box<ManagerError>,
    },
}

fn stage_failure_message(
    node: &str,
    stage: Stage,
    completed: &[Stage],
    source: &ManagerError,
) -> String {
    let residue: Vec<&str> = completed.iter().filter_map(Stage::residue).collect();
    if residue.is_empty() {
        format!("node {node}: stage {stage} failed: {source}")
    } else {
        format!(
            "node {node}: stage {stage} failed: {source} ({} but {stage} failed; manual cleanup required)",
            residue.join(", ")
        )
    }
}

impl ManagerError {
    pub fn backend(
        operation: &'static str,
        target: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        ManagerError::Backend {
            operation,
            target: target.into(),
            source,
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ManagerError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for `NotFound`, including when wrapped by a failed stage
    pub fn is_not_found(&self) -> bool {
        match self {
            ManagerError::NotFound { .. } => true,
            ManagerError::StageFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The stage that failed, if this error came out of a lifecycle operation
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            ManagerError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
