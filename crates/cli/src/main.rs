//! Kubernetes Cluster Manager CLI
//!
//! Creates, deletes and replaces nodes of a self-managed cluster, and
//! audits the cluster against its compute and load balancer resources.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cluster_lib::NodeRole;
use commands::{cluster, node, ClusterContext};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Kubernetes Cluster Manager CLI
#[derive(Parser)]
#[command(name = "kcm")]
#[command(author, version, about = "CLI for Kubernetes Cluster Manager", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Cluster to operate on
    #[arg(long, short, global = true, env = "KCM_CLUSTER")]
    pub cluster: Option<String>,

    /// Cluster configuration file (KCM_* environment variables apply on top)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// AWS profile
    #[arg(long, global = true, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Path to kubeconfig file (KUBECONFIG or ~/.kube/config if not specified)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, delete and replace cluster nodes
    #[command(subcommand)]
    Node(NodeCommands),

    /// Describe and reconcile the cluster
    #[command(subcommand)]
    Cluster(ClusterCommands),
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Launch, configure and register a new node
    Create(CreateArgs),

    /// Deregister and terminate a node
    Delete {
        /// Node name (short or fully qualified)
        name: String,

        #[command(flatten)]
        dns: DnsArgs,
    },

    /// Replace a node: delete it, then create it again under the same name
    Glass(CreateArgs),

    /// List the cluster's compute instances
    List,

    /// Dedicate a node to a workload class with a label and NoSchedule taint
    Purpose {
        /// Kubernetes node name
        name: String,

        /// Purpose value, e.g. "ingress"
        purpose: String,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Node name (short or fully qualified)
    #[arg(required_unless_present = "index")]
    pub name: Option<String>,

    /// Derive the name from the cluster, role and slot number
    #[arg(long, conflicts_with = "name")]
    pub index: Option<u32>,

    /// Node role (controlplane or worker)
    #[arg(long, short, default_value = "worker")]
    pub role: NodeRole,

    /// Machine configuration file (read from Vault when omitted)
    #[arg(long)]
    pub machine_config: Option<PathBuf>,

    /// Machine configuration patch file (read from Vault when omitted)
    #[arg(long)]
    pub patch: Option<PathBuf>,

    /// Node configuration JSON file (read from Vault when omitted)
    #[arg(long)]
    pub node_config: Option<PathBuf>,

    /// Additional patch files applied after the role patch
    #[arg(long = "extra-patch")]
    pub extra_patches: Vec<PathBuf>,

    /// Vault address
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// Vault KV v2 mount holding the node bundles
    #[arg(long)]
    pub secret_mount: Option<String>,

    #[command(flatten)]
    pub dns: DnsArgs,
}

/// Cloudflare credentials. Without flags, `CLOUDFLARE_ZONE_ID` and
/// `CLOUDFLARE_API_TOKEN` are read from the environment.
#[derive(Args)]
pub struct DnsArgs {
    /// Cloudflare zone holding the node records
    #[arg(long, requires = "cloudflare_api_token")]
    pub cloudflare_zone_id: Option<String>,

    /// Cloudflare API token
    #[arg(long, requires = "cloudflare_zone_id")]
    pub cloudflare_api_token: Option<String>,
}

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Show nodes and load balancer targets
    Describe {
        /// Add vCPU, memory and daily cost estimates
        #[arg(long)]
        cost: bool,
    },

    /// Compare compute instances, Kubernetes nodes and load balancer targets
    Reconcile {
        /// Tag running instances that are missing the cluster tag
        #[arg(long)]
        fix_tags: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.global.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let defaults = config::Config::load()?;

    if let Err(e) = run(cli, &defaults).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli, defaults: &config::Config) -> Result<()> {
    let format = cli.global.format;
    let ctx = ClusterContext::new(&cli.global, defaults)?;

    match cli.command {
        Commands::Node(node_cmd) => match node_cmd {
            NodeCommands::Create(args) => node::create(&ctx, &args, defaults, format).await,
            NodeCommands::Delete { name, dns } => node::delete(&ctx, &name, &dns, format).await,
            NodeCommands::Glass(args) => node::glass(&ctx, &args, defaults, format).await,
            NodeCommands::List => node::list(&ctx, format).await,
            NodeCommands::Purpose { name, purpose } => {
                node::purpose(&ctx, &name, &purpose, format).await
            }
        },
        Commands::Cluster(cluster_cmd) => match cluster_cmd {
            ClusterCommands::Describe { cost } => cluster::describe(&ctx, cost, format).await,
            ClusterCommands::Reconcile { fix_tags } => {
                cluster::reconcile(&ctx, fix_tags, format).await
            }
        },
    }
}
