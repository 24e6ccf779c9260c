//! Periodic cluster health check
//!
//! Runs a fresh reconciliation on every tick and additionally flags load
//! balancer targets that are not in the healthy state. Ticks never
//! overlap: a slow check delays the next one. A failed check is logged
//! and the loop carries on.

use crate::error::{ManagerError, ManagerResult};
use crate::health::{components, HealthRegistry};
use crate::observability::{ManagerMetrics, StructuredLogger};
use crate::reconcile::{ReconciliationReport, Reconciler};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Configuration for the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between checks (default: 60 seconds)
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// A registered target outside the healthy state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhealthyTarget {
    pub load_balancer: String,
    pub target: String,
    pub port: u16,
    pub state: String,
}

impl fmt::Display for UnhealthyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{} ({})",
            self.load_balancer, self.target, self.port, self.state
        )
    }
}

/// Result of one check
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub report: ReconciliationReport,
    pub unhealthy_targets: Vec<UnhealthyTarget>,
    /// Number of problem categories with at least one entry
    pub issue_count: usize,
}

impl HealthSummary {
    pub fn from_report(report: ReconciliationReport, healthy_state: &str) -> Self {
        let unhealthy_targets: Vec<UnhealthyTarget> = report
            .observed
            .load_balancers
            .iter()
            .flat_map(|lb| {
                lb.targets
                    .iter()
                    .filter(|t| t.state != healthy_state)
                    .map(|t| UnhealthyTarget {
                        load_balancer: lb.name.clone(),
                        target: t.name.clone(),
                        port: t.port,
                        state: t.state.clone(),
                    })
            })
            .collect();

        let categories = report.class_counts().iter().filter(|(_, n)| *n > 0).count();
        let issue_count = categories + usize::from(!unhealthy_targets.is_empty());

        Self {
            report,
            unhealthy_targets,
            issue_count,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.issue_count == 0
    }

    /// Every unhealthy target and discrepancy entry as `(kind, subject)`
    pub fn issues(&self) -> Vec<(&'static str, String)> {
        let report = &self.report;
        let mut issues: Vec<(&'static str, String)> = self
            .unhealthy_targets
            .iter()
            .map(|t| ("unhealthy_target", t.to_string()))
            .collect();
        issues.extend(
            report
                .missing_cluster_tag
                .iter()
                .map(|i| ("missing_cluster_tag", format!("{} ({})", i.name, i.identity))),
        );
        for (kind, names) in [
            ("not_in_k8s", &report.not_in_k8s),
            ("not_in_ec2", &report.not_in_ec2),
            ("not_in_lb", &report.not_in_lb),
            ("lb_without_ec2", &report.lb_without_ec2),
        ] {
            issues.extend(names.iter().map(|name| (kind, name.clone())));
        }
        issues
    }
}

impl fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observed = &self.report.observed;
        if self.is_healthy() {
            return writeln!(
                f,
                "✓ All systems healthy - EC2: {}, K8s: {}, LB Targets: {}",
                observed.ec2_nodes.len(),
                observed.k8s_nodes.len(),
                observed.lb_targets.len()
            );
        }

        writeln!(f, "Found {} issue(s)", self.issue_count)?;
        if !self.unhealthy_targets.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "⚠ Unhealthy Load Balancer Targets: {}",
                self.unhealthy_targets.len()
            )?;
            for target in &self.unhealthy_targets {
                writeln!(f, "  - {}", target)?;
            }
        }
        if !self.report.is_clean() {
            writeln!(f)?;
            write!(f, "{}", self.report)?;
        }
        Ok(())
    }
}

/// The health registry component a failed check points at
fn failed_component(err: &ManagerError) -> &'static str {
    match err {
        ManagerError::Backend { operation, .. } => match *operation {
            "list kubernetes nodes" => components::KUBERNETES,
            "describe load balancers"
            | "describe tags"
            | "describe target groups"
            | "describe target health" => components::LOAD_BALANCERS,
            _ => components::COMPUTE,
        },
        _ => components::MONITOR,
    }
}

/// Periodic health check over one cluster
pub struct ClusterMonitor {
    reconciler: Arc<Reconciler>,
    cluster: String,
    healthy_state: String,
    config: MonitorConfig,
    health: Option<HealthRegistry>,
    metrics: ManagerMetrics,
    logger: StructuredLogger,
}

impl ClusterMonitor {
    pub fn new(reconciler: Arc<Reconciler>, config: MonitorConfig) -> Self {
        let cluster_config = reconciler.locator().config();
        let cluster = cluster_config.cluster_name.clone();
        let healthy_state = cluster_config.healthy_state.clone();
        Self {
            reconciler,
            logger: StructuredLogger::new(cluster.clone()),
            cluster,
            healthy_state,
            config,
            health: None,
            metrics: ManagerMetrics::new(),
        }
    }

    /// Report data source health into `registry` after every check
    pub fn with_health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    /// One independent check
    pub async fn check_once(&self) -> ManagerResult<HealthSummary> {
        let report = self.reconciler.reconcile(&self.cluster).await?;
        Ok(HealthSummary::from_report(report, &self.healthy_state))
    }

    /// Check immediately, then every interval until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            cluster = %self.cluster,
            interval_secs = self.config.interval.as_secs(),
            "Starting cluster monitor loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!(cluster = %self.cluster, "Shutting down cluster monitor loop");
                    break;
                }
            }
        }
    }

    async fn tick(&self) -> Option<HealthSummary> {
        self.metrics.inc_monitor_ticks();

        match self.check_once().await {
            Ok(summary) => {
                self.record_summary(&summary).await;
                Some(summary)
            }
            Err(err) => {
                self.metrics.inc_monitor_failures();
                self.logger.log_monitor_failure(&err);
                if let Some(health) = &self.health {
                    health.set_unhealthy(failed_component(&err), err.to_string()).await;
                    health.set_ready(true).await;
                }
                None
            }
        }
    }

    async fn record_summary(&self, summary: &HealthSummary) {
        let report = &summary.report;
        for (class, count) in report.class_counts() {
            self.metrics.set_discrepancies(class, count);
        }
        self.metrics
            .set_unhealthy_targets(summary.unhealthy_targets.len());
        self.logger.log_monitor_tick(
            summary.issue_count,
            summary.unhealthy_targets.len(),
            report.discrepancy_count(),
        );
        for (kind, subject) in summary.issues() {
            self.logger.log_monitor_issue(kind, &subject);
        }

        if let Some(health) = &self.health {
            for component in [
                components::COMPUTE,
                components::LOAD_BALANCERS,
                components::KUBERNETES,
            ] {
                health.set_healthy(component).await;
            }
            if summary.is_healthy() {
                health.set_healthy(components::MONITOR).await;
            } else {
                health
                    .set_degraded(
                        components::MONITOR,
                        format!("{} issue(s) found", summary.issue_count),
                    )
                    .await;
            }
            health.set_ready(true).await;
        }
    }
}
