//! Node lifecycle commands

use anyhow::{Context, Result};
use cluster_lib::{
    bootstrap::TalosCtl,
    dns::{CloudflareDns, DEFAULT_CLOUDFLARE_API},
    names,
    secrets::{BundleFiles, NodeBundle, VaultClient, VaultSource},
    ClusterNode, CreateNodeRequest, NodeInfo, NodeLifecycle,
};
use colored::Colorize;
use std::sync::Arc;

use super::ClusterContext;
use crate::config::Config;
use crate::output::{print_info, print_json, print_success, print_table, NodeRow, OutputFormat};
use crate::{CreateArgs, DnsArgs};

/// KV v2 mount used when neither the flag nor the user config names one
const DEFAULT_SECRET_MOUNT: &str = "secret";

fn dns_client(args: &DnsArgs) -> Result<CloudflareDns> {
    match (&args.cloudflare_zone_id, &args.cloudflare_api_token) {
        (Some(zone_id), Some(token)) => CloudflareDns::new(DEFAULT_CLOUDFLARE_API, zone_id, token),
        _ => CloudflareDns::from_env(),
    }
}

async fn lifecycle(ctx: &ClusterContext, dns: &DnsArgs) -> Result<NodeLifecycle> {
    let dns = dns_client(dns)?;

    NodeLifecycle::builder()
        .config(ctx.config.clone())
        .compute(ctx.compute())
        .load_balancers(ctx.load_balancers())
        .dns(Arc::new(dns))
        .bootstrap(Arc::new(TalosCtl::default()))
        .kubernetes(ctx.kubernetes().await?)
        .build()
}

fn node_name(ctx: &ClusterContext, args: &CreateArgs) -> Result<String> {
    match (&args.name, args.index) {
        (Some(name), _) => Ok(names::short_name(name).to_string()),
        (None, Some(index)) => Ok(names::node_name(ctx.cluster(), args.role, index)),
        (None, None) => anyhow::bail!("a node name or --index is required"),
    }
}

/// Machine config, patches and node config for a create, files first
async fn create_request(
    ctx: &ClusterContext,
    args: &CreateArgs,
    defaults: &Config,
) -> Result<CreateNodeRequest> {
    let name = node_name(ctx, args)?;
    let files = BundleFiles {
        machine_config: args.machine_config.clone(),
        patch: args.patch.clone(),
        node_config: args.node_config.clone(),
    };

    let needs_vault =
        files.machine_config.is_none() || files.patch.is_none() || files.node_config.is_none();
    let vault = if needs_vault {
        Some(VaultClient::from_env(args.vault_addr.as_deref())?)
    } else {
        None
    };
    let mount = args
        .secret_mount
        .as_deref()
        .or(defaults.secret_mount.as_deref())
        .unwrap_or(DEFAULT_SECRET_MOUNT);
    let source = vault.as_ref().map(|client| VaultSource { client, mount });

    let bundle = NodeBundle::load(ctx.cluster(), args.role, &files, source).await?;

    let mut patches = vec![bundle.patch];
    for path in &args.extra_patches {
        let patch = std::fs::read(path)
            .with_context(|| format!("Failed to read patch {}", path.display()))?;
        patches.push(patch);
    }

    Ok(CreateNodeRequest {
        name,
        role: args.role,
        node_config: bundle.node_config,
        machine_config: bundle.machine_config,
        patches,
    })
}

/// Create a node
pub async fn create(
    ctx: &ClusterContext,
    args: &CreateArgs,
    defaults: &Config,
    format: OutputFormat,
) -> Result<()> {
    let request = create_request(ctx, args, defaults).await?;
    let lifecycle = lifecycle(ctx, &args.dns).await?;

    print_info(&format!("Creating {} node {}", request.role, request.name.cyan()));
    let node = lifecycle.create(&request).await?;

    match format {
        OutputFormat::Json => print_json(&node)?,
        OutputFormat::Table => print_success(&format!(
            "Created {} ({}, {})",
            node.fqdn(),
            node.identity,
            node.ip
        )),
    }
    Ok(())
}

/// Delete a node
pub async fn delete(
    ctx: &ClusterContext,
    name: &str,
    dns: &DnsArgs,
    format: OutputFormat,
) -> Result<()> {
    let lifecycle = lifecycle(ctx, dns).await?;

    print_info(&format!("Deleting node {}", name.cyan()));
    let deleted = lifecycle.delete(name).await?;

    match format {
        OutputFormat::Json => print_json(&deleted)?,
        OutputFormat::Table => {
            println!(
                "  DNS records removed:        {}",
                deleted.dns_records_removed
            );
            println!(
                "  Target groups deregistered: {}",
                deleted.target_groups_deregistered
            );
            print_success(&format!("Deleted {} ({})", deleted.name, deleted.identity));
        }
    }
    Ok(())
}

/// Replace a node with a fresh instance of the same name
pub async fn glass(
    ctx: &ClusterContext,
    args: &CreateArgs,
    defaults: &Config,
    format: OutputFormat,
) -> Result<()> {
    let request = create_request(ctx, args, defaults).await?;
    let lifecycle = lifecycle(ctx, &args.dns).await?;

    print_info(&format!("Replacing node {}", request.name.cyan()));
    let node = lifecycle.glass(&request).await?;

    match format {
        OutputFormat::Json => print_json(&node)?,
        OutputFormat::Table => print_success(&format!(
            "Replaced {} with {} ({})",
            node.fqdn(),
            node.identity,
            node.ip
        )),
    }
    Ok(())
}

/// List the cluster's instances
pub async fn list(ctx: &ClusterContext, format: OutputFormat) -> Result<()> {
    let locator = ctx.locator();
    let instances = locator.cluster_instances(ctx.cluster()).await?;

    let mut nodes: Vec<NodeInfo> = instances.iter().map(NodeInfo::from_instance).collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        OutputFormat::Json => print_json(&nodes)?,
        OutputFormat::Table => {
            let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
            print_table(&rows, format);
        }
    }
    Ok(())
}

/// Label and taint a node for one workload class
pub async fn purpose(
    ctx: &ClusterContext,
    name: &str,
    purpose: &str,
    format: OutputFormat,
) -> Result<()> {
    let kubernetes = ctx.kubernetes().await?;
    kubernetes
        .apply_purpose(name, purpose)
        .await
        .with_context(|| format!("Failed to mark {} with purpose {}", name, purpose))?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "node": name,
            "purpose": purpose,
        }))?,
        OutputFormat::Table => print_success(&format!(
            "Node {} labelled and tainted purpose={}",
            name, purpose
        )),
    }
    Ok(())
}
