//! Core library for self-managed Kubernetes cluster nodes
//!
//! This crate provides the core functionality for:
//! - Node lifecycle orchestration (create, delete, glass)
//! - Tag-based discovery of cluster resources
//! - Load balancer target registration
//! - Reconciliation of compute, Kubernetes and load balancer views
//! - Continuous monitoring with health checks and metrics

pub mod bootstrap;
pub mod compute;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod health;
pub mod kubernetes;
pub mod lifecycle;
pub mod locator;
pub mod models;
pub mod monitor;
pub mod names;
pub mod observability;
pub mod pricing;
pub mod reconcile;
pub mod registrar;
pub mod secrets;

#[cfg(test)]
mod testing;

pub use crate::config::{ClusterConfig, DialConfig};
pub use error::{ManagerError, ManagerResult, Stage};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{CreateNodeRequest, DeletedNode, NodeLifecycle, NodeLifecycleBuilder};
pub use locator::ResourceLocator;
pub use models::*;
pub use monitor::{ClusterMonitor, HealthSummary, MonitorConfig};
pub use observability::{ManagerMetrics, StructuredLogger};
pub use reconcile::{ObservedState, Reconciler, ReconciliationReport};
pub use registrar::LoadBalancerRegistrar;
pub use secrets::{BundleFiles, NodeBundle, VaultClient, VaultSource};
