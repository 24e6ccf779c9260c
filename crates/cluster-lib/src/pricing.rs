//! Instance sizing and on-demand cost estimates
//!
//! Decorates [`NodeInfo`] in cluster descriptions. Prices are approximate
//! us-east-1 on-demand rates scaled by a per-region multiplier; operators
//! can override any instance type.

use crate::models::NodeInfo;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;

/// vCPU and memory of an instance type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceSpecs {
    pub vcpus: u32,
    pub memory_gib: f64,
}

pub fn instance_specs(instance_type: &str) -> Option<InstanceSpecs> {
    let (vcpus, memory_gib) = match instance_type {
        "t3.nano" => (2, 0.5),
        "t3.micro" => (2, 1.0),
        "t3.small" => (2, 2.0),
        "t3.medium" => (2, 4.0),
        "t3.large" => (2, 8.0),
        "t3.xlarge" => (4, 16.0),
        "m5.large" => (2, 8.0),
        "m5.xlarge" => (4, 16.0),
        "m5.2xlarge" => (8, 32.0),
        "m5.4xlarge" => (16, 64.0),
        "m5.8xlarge" => (32, 128.0),
        "c5.large" => (2, 4.0),
        "c5.xlarge" => (4, 8.0),
        "c5.2xlarge" => (8, 16.0),
        "c5.4xlarge" => (16, 32.0),
        "c5.9xlarge" => (36, 72.0),
        "r5.large" => (2, 16.0),
        "r5.xlarge" => (4, 32.0),
        "r5.2xlarge" => (8, 64.0),
        "r5.4xlarge" => (16, 128.0),
        "r5.8xlarge" => (32, 256.0),
        _ => return None,
    };
    Some(InstanceSpecs { vcpus, memory_gib })
}

fn base_hourly_price(instance_type: &str) -> Option<f64> {
    let price = match instance_type {
        "t3.nano" => 0.0052,
        "t3.micro" => 0.0104,
        "t3.small" => 0.0208,
        "t3.medium" => 0.0416,
        "t3.large" => 0.0832,
        "t3.xlarge" => 0.1664,
        "m5.large" => 0.096,
        "m5.xlarge" => 0.192,
        "m5.2xlarge" => 0.384,
        "m5.4xlarge" => 0.768,
        "m5.8xlarge" => 1.536,
        "c5.large" => 0.085,
        "c5.xlarge" => 0.17,
        "c5.2xlarge" => 0.34,
        "c5.4xlarge" => 0.68,
        "c5.9xlarge" => 1.53,
        "r5.large" => 0.126,
        "r5.xlarge" => 0.252,
        "r5.2xlarge" => 0.504,
        "r5.4xlarge" => 1.008,
        "r5.8xlarge" => 2.016,
        _ => return None,
    };
    Some(price)
}

/// Regional price relative to us-east-1; unknown regions price as us-east-1
pub fn region_multiplier(region: &str) -> f64 {
    match region {
        "us-west-1" | "eu-west-1" | "eu-west-2" | "eu-central-1" => 1.05,
        "ap-southeast-1" => 1.1,
        "ap-southeast-2" | "ap-northeast-1" => 1.15,
        _ => 1.0,
    }
}

/// Estimates what an instance type costs to run
pub trait CostEstimator: Send + Sync {
    fn hourly_cost(&self, instance_type: &str) -> Result<f64>;

    fn daily_cost(&self, instance_type: &str) -> Result<f64> {
        let hourly = self
            .hourly_cost(instance_type)
            .with_context(|| format!("no hourly cost for instance type {}", instance_type))?;
        Ok(hourly * 24.0)
    }
}

/// Static on-demand price table
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    region: String,
    overrides: HashMap<String, f64>,
}

impl StaticPricing {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            overrides: HashMap::new(),
        }
    }

    /// Override the hourly price of individual instance types
    pub fn with_overrides(mut self, overrides: HashMap<String, f64>) -> Self {
        self.overrides = overrides;
        self
    }
}

impl CostEstimator for StaticPricing {
    fn hourly_cost(&self, instance_type: &str) -> Result<f64> {
        if let Some(price) = self.overrides.get(instance_type) {
            return Ok(*price);
        }
        base_hourly_price(instance_type)
            .map(|price| price * region_multiplier(&self.region))
            .ok_or_else(|| {
                anyhow!(
                    "no pricing data for instance type {} in region {}",
                    instance_type,
                    self.region
                )
            })
    }
}

/// Sum of node daily costs. Nodes without an instance type or with an
/// unpriced type are skipped.
pub fn cluster_daily_cost(nodes: &[NodeInfo], estimator: &dyn CostEstimator) -> f64 {
    nodes
        .iter()
        .filter(|node| !node.instance_type.is_empty())
        .filter_map(|node| estimator.daily_cost(&node.instance_type).ok())
        .sum()
}
