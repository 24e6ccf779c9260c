//! Output formatting utilities

use clap::ValueEnum;
use cluster_lib::{LBInfo, NodeInfo};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Row for node tables
#[derive(Tabled, Serialize)]
pub struct NodeRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Instance")]
    pub identity: String,
    #[tabled(rename = "Type")]
    pub instance_type: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Private IP")]
    pub private_ip: String,
    #[tabled(rename = "vCPU")]
    pub vcpus: String,
    #[tabled(rename = "Memory")]
    pub memory: String,
    #[tabled(rename = "Daily Cost")]
    pub daily_cost: String,
}

impl From<&NodeInfo> for NodeRow {
    fn from(node: &NodeInfo) -> Self {
        Self {
            name: node.name.clone(),
            identity: node.identity.clone(),
            instance_type: node.instance_type.clone(),
            state: color_state(node.state.as_deref().unwrap_or("-")),
            private_ip: node.private_ip.clone().unwrap_or_else(|| "-".to_string()),
            vcpus: node
                .vcpus
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: node
                .memory_gib
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            daily_cost: node
                .daily_cost
                .map(format_currency)
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Row for load balancer target tables
#[derive(Tabled, Serialize)]
pub struct TargetRow {
    #[tabled(rename = "Load Balancer")]
    pub load_balancer: String,
    #[tabled(rename = "Target")]
    pub target: String,
    #[tabled(rename = "Instance")]
    pub identity: String,
    #[tabled(rename = "Port")]
    pub port: u16,
    #[tabled(rename = "State")]
    pub state: String,
}

/// One row per registered target; a load balancer without targets gets
/// a placeholder row
pub fn target_rows(load_balancers: &[LBInfo]) -> Vec<TargetRow> {
    let mut rows = Vec::new();
    for lb in load_balancers {
        if lb.targets.is_empty() {
            rows.push(TargetRow {
                load_balancer: lb.name.clone(),
                target: "-".to_string(),
                identity: "-".to_string(),
                port: 0,
                state: "-".to_string(),
            });
        }
        for target in &lb.targets {
            rows.push(TargetRow {
                load_balancer: lb.name.clone(),
                target: if target.name.is_empty() {
                    "-".to_string()
                } else {
                    target.name.clone()
                },
                identity: target.identity.clone(),
                port: target.port,
                state: color_state(&target.state),
            });
        }
    }
    rows
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&items) {
                println!("{}", json);
            }
        }
    }
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn format_memory(gib: f64) -> String {
    if gib.fract() == 0.0 {
        format!("{:.0}Gi", gib)
    } else {
        format!("{:.1}Gi", gib)
    }
}

pub fn format_currency(amount: f64) -> String {
    format!("${:.2}", amount)
}

/// Color instance and target states
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "healthy" | "running" => state.green().to_string(),
        "pending" | "initial" | "draining" | "stopping" => state.yellow().to_string(),
        "unhealthy" | "unavailable" | "stopped" | "terminated" | "shutting-down" => {
            state.red().to_string()
        }
        _ => state.to_string(),
    }
}
