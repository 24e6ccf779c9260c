//! Cluster monitor daemon internals: settings and the health/metrics API

pub mod api;
pub mod config;
