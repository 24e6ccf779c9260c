//! `talosctl apply-config` wrapper

use super::{async_trait, NodeBootstrapper};
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Applies machine configuration through the talosctl binary
#[derive(Debug, Clone)]
pub struct TalosCtl {
    binary: String,
    timeout: Duration,
}

impl Default for TalosCtl {
    fn default() -> Self {
        Self::new("talosctl")
    }
}

impl TalosCtl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn write_temp(contents: &[u8], suffix: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("machine-config-")
        .suffix(suffix)
        .tempfile()
        .context("Failed to create temporary config file")?;
    file.write_all(contents)
        .context("Failed to write temporary config file")?;
    file.flush()?;
    Ok(file)
}

fn apply_args(address: &str, config: &NamedTempFile, patches: &[NamedTempFile], insecure: bool) -> Vec<String> {
    let mut args = vec![
        "apply-config".to_string(),
        "--nodes".to_string(),
        address.to_string(),
        "--file".to_string(),
        config.path().display().to_string(),
    ];
    if insecure {
        args.push("--insecure".to_string());
    }
    for patch in patches {
        args.push("--config-patch".to_string());
        args.push(format!("@{}", patch.path().display()));
    }
    args
}

#[async_trait]
impl NodeBootstrapper for TalosCtl {
    async fn apply_configuration(
        &self,
        address: &str,
        base_config: &[u8],
        patches: &[Vec<u8>],
        insecure: bool,
    ) -> Result<()> {
        // Files live until the end of this call
        let config = write_temp(base_config, ".yaml")?;
        let patch_files = patches
            .iter()
            .map(|p| write_temp(p, ".yaml"))
            .collect::<Result<Vec<_>>>()?;

        let args = apply_args(address, &config, &patch_files, insecure);
        info!(node = %address, patches = patches.len(), insecure, "Applying machine configuration");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("talosctl apply-config timed out after {:?}", self.timeout))?
            .context("Failed to execute talosctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(node = %address, error = %stderr, "talosctl apply-config failed");
            bail!("talosctl apply-config failed for {}: {}", address, stderr);
        }
        Ok(())
    }
}
