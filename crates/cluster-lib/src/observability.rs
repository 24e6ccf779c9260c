//! Observability infrastructure for the cluster manager
//!
//! Provides:
//! - Prometheus metrics (monitor ticks, discrepancies, unhealthy targets, lifecycle outcomes)
//! - Structured logging of lifecycle and monitor events with tracing

use crate::error::{ManagerError, Stage};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Reconciliation durations in seconds; a run issues dozens of API calls
const RECONCILE_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ManagerMetricsInner> = OnceLock::new();

struct ManagerMetricsInner {
    monitor_ticks: IntCounter,
    monitor_failures: IntCounter,
    reconcile_duration_seconds: Histogram,
    discrepancies: IntGaugeVec,
    unhealthy_targets: IntGauge,
    lifecycle_operations: IntCounterVec,
}

impl ManagerMetricsInner {
    fn new() -> Self {
        Self {
            monitor_ticks: register_int_counter!(
                "cluster_manager_monitor_ticks_total",
                "Number of monitor health checks run"
            )
            .expect("Failed to register monitor_ticks"),

            monitor_failures: register_int_counter!(
                "cluster_manager_monitor_failures_total",
                "Number of monitor health checks that failed to fetch a data source"
            )
            .expect("Failed to register monitor_failures"),

            reconcile_duration_seconds: register_histogram!(
                "cluster_manager_reconcile_duration_seconds",
                "Time spent gathering and comparing cluster state",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            discrepancies: register_int_gauge_vec!(
                "cluster_manager_discrepancies",
                "Discrepancies found by the last reconciliation, by class",
                &["class"]
            )
            .expect("Failed to register discrepancies"),

            unhealthy_targets: register_int_gauge!(
                "cluster_manager_unhealthy_targets",
                "Load balancer targets not in the healthy state at the last check"
            )
            .expect("Failed to register unhealthy_targets"),

            lifecycle_operations: register_int_counter_vec!(
                "cluster_manager_lifecycle_operations_total",
                "Node create, delete and glass operations by outcome",
                &["operation", "outcome"]
            )
            .expect("Failed to register lifecycle_operations"),
        }
    }
}

/// Handle to the process-wide cluster manager metrics.
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ManagerMetrics {
    _private: (),
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ManagerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ManagerMetricsInner {
        GLOBAL_METRICS.get_or_init(ManagerMetricsInner::new)
    }

    pub fn inc_monitor_ticks(&self) {
        self.inner().monitor_ticks.inc();
    }

    pub fn inc_monitor_failures(&self) {
        self.inner().monitor_failures.inc();
    }

    pub fn observe_reconcile_duration(&self, secs: f64) {
        self.inner().reconcile_duration_seconds.observe(secs);
    }

    /// Set the discrepancy gauge for one class
    pub fn set_discrepancies(&self, class: &str, count: usize) {
        self.inner()
            .discrepancies
            .with_label_values(&[class])
            .set(count as i64);
    }

    pub fn set_unhealthy_targets(&self, count: usize) {
        self.inner().unhealthy_targets.set(count as i64);
    }

    /// Count one lifecycle operation outcome (`success` or `failure`)
    pub fn record_lifecycle(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .lifecycle_operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn lifecycle_count(&self, operation: &str, outcome: &str) -> u64 {
        self.inner()
            .lifecycle_operations
            .with_label_values(&[operation, outcome])
            .get()
    }
}

/// Structured logger for lifecycle and monitor events
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_operation_started(&self, operation: &str, node: &str) {
        info!(
            event = "node_operation_started",
            cluster = %self.cluster,
            operation = %operation,
            node = %node,
            "Node operation started"
        );
    }

    pub fn log_stage_completed(&self, operation: &str, node: &str, stage: Stage) {
        info!(
            event = "node_stage_completed",
            cluster = %self.cluster,
            operation = %operation,
            node = %node,
            stage = %stage,
            "Stage completed"
        );
    }

    /// Failure of a stage, naming the side effects already in place
    pub fn log_stage_failed(
        &self,
        operation: &str,
        node: &str,
        stage: Stage,
        completed: &[Stage],
        err: &ManagerError,
    ) {
        let completed: Vec<&str> = completed.iter().map(Stage::as_str).collect();
        error!(
            event = "node_stage_failed",
            cluster = %self.cluster,
            operation = %operation,
            node = %node,
            stage = %stage,
            completed = ?completed,
            manual_cleanup = !completed.is_empty(),
            error = %err,
            "Stage failed"
        );
    }

    pub fn log_operation_finished(&self, operation: &str, node: &str, identity: &str) {
        info!(
            event = "node_operation_finished",
            cluster = %self.cluster,
            operation = %operation,
            node = %node,
            identity = %identity,
            "Node operation finished"
        );
    }

    pub fn log_monitor_tick(&self, issues: usize, unhealthy_targets: usize, discrepancies: usize) {
        if issues == 0 {
            info!(
                event = "monitor_tick",
                cluster = %self.cluster,
                issues,
                "All systems healthy"
            );
        } else {
            warn!(
                event = "monitor_tick",
                cluster = %self.cluster,
                issues,
                unhealthy_targets,
                discrepancies,
                "Cluster issues found"
            );
        }
    }

    pub fn log_monitor_issue(&self, kind: &str, subject: &str) {
        warn!(
            event = "monitor_issue",
            cluster = %self.cluster,
            kind,
            subject = %subject,
            "Cluster issue"
        );
    }

    pub fn log_monitor_failure(&self, err: &ManagerError) {
        warn!(
            event = "monitor_tick_failed",
            cluster = %self.cluster,
            error = %err,
            "Health check failed, retrying next tick"
        );
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64) {
        info!(
            event = "monitor_started",
            cluster = %self.cluster,
            version = %version,
            interval_secs,
            "Cluster monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Cluster monitor shutting down"
        );
    }
}
