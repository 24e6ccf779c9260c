//! Health tracking for the monitor daemon
//!
//! Each data source the monitor depends on (compute, load balancers,
//! Kubernetes) records the outcome of every check: when it was last
//! reached and the error from the latest failure. The registry backs the
//! daemon's liveness and readiness probes.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// The check ran but found cluster issues
    Degraded,
    /// The source could not be reached
    Unhealthy,
}

/// Outcome of the latest check against one source
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    /// Unix time of the latest check
    pub checked_at: i64,
    /// Unix time the source last answered; `None` until it first does
    pub last_success: Option<i64>,
    /// Failure or issue text from the latest check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ComponentHealth {
    fn registered() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            checked_at: Utc::now().timestamp(),
            last_success: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all sources
    fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let any = |status| components.values().any(|c| c.status == status);
        if any(ComponentStatus::Unhealthy) {
            ComponentStatus::Unhealthy
        } else if any(ComponentStatus::Degraded) {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const COMPUTE: &str = "compute";
    pub const LOAD_BALANCERS: &str = "load_balancers";
    pub const KUBERNETES: &str = "kubernetes";
    pub const MONITOR: &str = "monitor";

    /// All components registered at daemon startup
    pub const ALL: &[&str] = &[COMPUTE, LOAD_BALANCERS, KUBERNETES, MONITOR];
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every name in `names` as healthy and not yet checked
    pub async fn register_all(&self, names: &[&str]) {
        let mut components = self.components.write().await;
        for name in names {
            components.insert(name.to_string(), ComponentHealth::registered());
        }
    }

    async fn record(&self, name: &str, status: ComponentStatus, error: Option<String>) {
        let now = Utc::now().timestamp();
        let mut components = self.components.write().await;
        let entry = components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::registered);
        entry.status = status;
        entry.checked_at = now;
        entry.last_error = error;
        if status != ComponentStatus::Unhealthy {
            entry.last_success = Some(now);
        }
    }

    pub async fn set_healthy(&self, name: &str) {
        self.record(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    /// Mark a source unreachable. Its `last_success` is kept.
    pub async fn set_unhealthy(&self, name: &str, error: impl Into<String>) {
        self.record(name, ComponentStatus::Unhealthy, Some(error.into()))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once the first check has finished and every source answers
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("First health check not yet completed".to_string()),
            };
        }

        let components = self.components.read().await;
        let mut unreachable: Vec<String> = components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, h)| match &h.last_error {
                Some(error) => format!("{} ({})", name, error),
                None => name.clone(),
            })
            .collect();
        unreachable.sort_unstable();

        if unreachable.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unreachable: {}", unreachable.join(", "))),
            }
        }
    }
}
