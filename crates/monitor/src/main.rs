//! Cluster monitor - periodic drift and target health checks
//!
//! Runs one reconciliation per interval against the compute provider,
//! the load balancers and the Kubernetes API, and serves the outcome on
//! `/healthz`, `/readyz` and `/metrics`.

use anyhow::{Context, Result};
use cluster_lib::{
    compute::{AwsCli, ComputeApi, LoadBalancerApi},
    health::{components, HealthRegistry},
    kubernetes::{KubeNodes, KubernetesApi},
    observability::{ManagerMetrics, StructuredLogger},
    ClusterConfig, ClusterMonitor, MonitorConfig, Reconciler, ResourceLocator,
};
use cluster_monitor::{api, config::MonitorSettings};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cluster-monitor");

    let settings = MonitorSettings::load()?;
    let cluster_config = ClusterConfig::load(settings.cluster_config_file.as_deref())
        .context("Failed to load cluster configuration")?;
    info!(
        cluster = %cluster_config.cluster_name,
        interval_secs = settings.interval_secs,
        "Monitor configured"
    );

    let aws = Arc::new(
        AwsCli::builder()
            .profile(settings.aws_profile.clone())
            .region(settings.aws_region.clone())
            .build(),
    );
    let compute: Arc<dyn ComputeApi> = aws.clone();
    let load_balancers: Arc<dyn LoadBalancerApi> = aws;
    let kubernetes: Arc<dyn KubernetesApi> =
        Arc::new(KubeNodes::connect(settings.kubeconfig.as_deref()).await?);

    let locator = Arc::new(ResourceLocator::new(
        cluster_config.clone(),
        compute.clone(),
        load_balancers,
    ));
    let reconciler = Arc::new(Reconciler::new(locator, compute, kubernetes));

    let health_registry = HealthRegistry::new();
    health_registry.register_all(components::ALL).await;

    let metrics = ManagerMetrics::new();
    let logger = StructuredLogger::new(&cluster_config.cluster_name);
    logger.log_startup(MONITOR_VERSION, settings.interval_secs);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor = ClusterMonitor::new(
        reconciler,
        MonitorConfig {
            interval: settings.interval(),
        },
    )
    .with_health(health_registry);
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    monitor_handle.await.context("Monitor loop panicked")?;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
