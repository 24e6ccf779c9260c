//! Cluster-wide commands

use anyhow::Result;
use cluster_lib::{
    pricing::{CostEstimator, StaticPricing},
    Reconciler,
};
use colored::Colorize;

use super::ClusterContext;
use crate::output::{
    format_currency, print_info, print_json, print_success, print_table, print_warning,
    target_rows, NodeRow, OutputFormat,
};

/// Show the cluster's nodes and load balancer targets
pub async fn describe(ctx: &ClusterContext, cost: bool, format: OutputFormat) -> Result<()> {
    let pricing = cost.then(|| StaticPricing::new(ctx.region()));
    let estimator = pricing.as_ref().map(|p| p as &dyn CostEstimator);

    let locator = ctx.locator();
    let info = locator.describe_cluster(ctx.cluster(), estimator).await?;

    match format {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Table => {
            println!("{}", "Cluster".bold());
            println!("{}", "=".repeat(50));
            println!("Name:                   {}", info.name.cyan());
            println!("Provider:               {}", info.provider);
            println!("Nodes:                  {}", info.nodes.len());
            println!("Load Balancers:         {}", info.load_balancers.len());
            if let Some(daily) = info.estimated_daily_cost {
                println!("Estimated Daily Cost:   {}", format_currency(daily).green());
            }
            println!();

            println!("{}", "Nodes".bold());
            let rows: Vec<NodeRow> = info.nodes.iter().map(NodeRow::from).collect();
            print_table(&rows, format);
            println!();

            println!("{}", "Load Balancer Targets".bold());
            print_table(&target_rows(&info.load_balancers), format);
        }
    }
    Ok(())
}

/// Compare compute, Kubernetes and load balancer views of the cluster
pub async fn reconcile(ctx: &ClusterContext, fix_tags: bool, format: OutputFormat) -> Result<()> {
    let reconciler = Reconciler::new(ctx.locator(), ctx.compute(), ctx.kubernetes().await?);
    let report = reconciler.reconcile(ctx.cluster()).await?;
    let missing = report.missing_tag_identities();

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print!("{}", report);
            if !report.is_clean() {
                println!();
                print_warning(&format!(
                    "{} discrepancies found",
                    report.discrepancy_count()
                ));
            }
        }
    }

    if missing.is_empty() {
        return Ok(());
    }

    let tag = &ctx.config.cluster_tag_key;
    if fix_tags {
        let tagged = reconciler.fix_missing_cluster_tags(&missing).await?;
        print_success(&format!(
            "Added {}={} tag to {} instances",
            tag,
            ctx.cluster(),
            tagged
        ));
    } else {
        print_info(&format!(
            "Run with --fix-tags to add the {}={} tag to {} instances",
            tag,
            ctx.cluster(),
            missing.len()
        ));
    }
    Ok(())
}
