//! Machine and node configuration sources
//!
//! The three inputs of a node create (machine config, machine config
//! patch, node config) come from files or from a Vault KV v2 mount under
//! `cluster-<cluster>-{machine,patch,node}-<role>`. A file always wins
//! over the secret for the same item.

use crate::error::{ManagerError, ManagerResult};
use crate::models::{NodeConfig, NodeRole};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Token file looked up in the home directory when `VAULT_TOKEN` is unset
pub const VAULT_TOKEN_FILE: &str = ".vault-token";

/// Read-only client for a Vault KV v2 engine
#[derive(Debug, Clone)]
pub struct VaultClient {
    client: reqwest::Client,
    address: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
struct KvResponse {
    data: KvData,
}

#[derive(Debug, Deserialize)]
struct KvData {
    data: Option<Map<String, Value>>,
}

/// `mount/secret` to the KV v2 data path `mount/data/secret`
pub fn v2_path(path: &str) -> Result<String> {
    match path.split_once('/') {
        Some((mount, secret)) if !mount.is_empty() && !secret.is_empty() => {
            Ok(format!("{}/data/{}", mount, secret))
        }
        _ => bail!(
            "invalid secret path {:?}: must be a mount and a secret separated by a slash",
            path
        ),
    }
}

/// Secret path of one bundle item, e.g. `secret/cluster-alpha-node-worker`
pub fn secret_path(mount: &str, cluster: &str, item: &str, role: NodeRole) -> String {
    format!(
        "{}/cluster-{}-{}-{}",
        mount.trim_end_matches('/'),
        cluster,
        item,
        role
    )
}

impl VaultClient {
    pub fn new(address: &str, token: impl Into<String>) -> Result<Self> {
        let base = if address.ends_with('/') {
            address.to_string()
        } else {
            format!("{}/", address)
        };
        let address = Url::parse(&base).context("Invalid Vault address")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            address,
            token: token.into(),
        })
    }

    /// Address from the argument or `VAULT_ADDR`; token from `VAULT_TOKEN`
    /// or `~/.vault-token`
    pub fn from_env(address: Option<&str>) -> Result<Self> {
        let address = match address {
            Some(address) => address.to_string(),
            None => std::env::var("VAULT_ADDR").context("VAULT_ADDR is not set")?,
        };
        let token = match std::env::var("VAULT_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => {
                let home = dirs_next::home_dir()
                    .ok_or_else(|| anyhow!("unable to look up home directory"))?;
                read_token_file(&home)?
            }
        };
        debug!(address = %address, "Using Vault");
        Self::new(&address, token)
    }

    /// Key/value pairs stored at `path` (`mount/secret`)
    pub async fn secret_data(&self, path: &str) -> Result<Map<String, Value>> {
        let url = self
            .address
            .join(&format!("v1/{}", v2_path(path)?))
            .context("Invalid secret path")?;

        let response = self
            .client
            .get(url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("Failed to look up {}", path))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            bail!("no secret at {}", path);
        }
        if !status.is_success() {
            bail!("Vault returned {} for {}", status, path);
        }

        let body: KvResponse = response
            .json()
            .await
            .with_context(|| format!("unparsable secret found at {}", path))?;
        body.data
            .data
            .ok_or_else(|| anyhow!("unparsable secret found at {}", path))
    }
}

/// Token from `<home>/.vault-token` with the trailing newline removed
pub fn read_token_file(home: &Path) -> Result<String> {
    let path = home.join(VAULT_TOKEN_FILE);
    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("No vault token found at {}", path.display()))?;
    Ok(token.trim_end_matches('\n').to_string())
}

/// Local overrides for bundle items
#[derive(Debug, Clone, Default)]
pub struct BundleFiles {
    pub machine_config: Option<PathBuf>,
    pub patch: Option<PathBuf>,
    pub node_config: Option<PathBuf>,
}

/// Where bundle items without a file come from
#[derive(Debug, Clone, Copy)]
pub struct VaultSource<'a> {
    pub client: &'a VaultClient,
    pub mount: &'a str,
}

/// Inputs of a node create
#[derive(Debug, Clone)]
pub struct NodeBundle {
    pub machine_config: Vec<u8>,
    pub patch: Vec<u8>,
    pub node_config: NodeConfig,
}

impl NodeBundle {
    /// Load every item, file first, then Vault. A missing or empty item is
    /// `ConfigurationInvalid`.
    pub async fn load(
        cluster: &str,
        role: NodeRole,
        files: &BundleFiles,
        vault: Option<VaultSource<'_>>,
    ) -> ManagerResult<Self> {
        let machine_config = load_item(cluster, role, "machine", files.machine_config.as_deref(), vault).await?;
        if machine_config.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "cannot proceed without a machine configuration".to_string(),
            ));
        }

        let patch = load_item(cluster, role, "patch", files.patch.as_deref(), vault).await?;
        if patch.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "cannot proceed without a machine configuration patch".to_string(),
            ));
        }

        let node_bytes = load_item(cluster, role, "node", files.node_config.as_deref(), vault).await?;
        if node_bytes.is_empty() {
            return Err(ManagerError::ConfigurationInvalid(
                "cannot proceed without a node configuration".to_string(),
            ));
        }
        let node_config = NodeConfig::from_json(&node_bytes)?;

        info!(cluster = %cluster, role = %role, "Loaded node bundle");
        Ok(Self {
            machine_config,
            patch,
            node_config,
        })
    }
}

async fn load_item(
    cluster: &str,
    role: NodeRole,
    item: &str,
    file: Option<&Path>,
    vault: Option<VaultSource<'_>>,
) -> ManagerResult<Vec<u8>> {
    if let Some(path) = file {
        debug!(item = %item, path = %path.display(), "Loading from file");
        return std::fs::read(path).map_err(|e| {
            ManagerError::ConfigurationInvalid(format!("failed to read {}: {}", path.display(), e))
        });
    }

    let Some(vault) = vault else {
        return Ok(Vec::new());
    };

    let path = secret_path(vault.mount, cluster, item, role);
    debug!(item = %item, path = %path, "Loading from Vault");
    let data = vault
        .client
        .secret_data(&path)
        .await
        .map_err(|e| ManagerError::backend("read secret", &path, e))?;

    // Secrets are stored as decoded documents; JSON is also valid YAML
    serde_json::to_vec_pretty(&data).map_err(|e| {
        ManagerError::ConfigurationInvalid(format!("secret {} is not serialisable: {}", path, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NODE_SECRET: &str = r#"{"data": {"data": {
        "image_id": "ami-123",
        "subnet_id": "subnet-1",
        "instance_type": "t3.large",
        "block_device_gb": 40
    }, "metadata": {"version": 3}}}"#;

    #[test]
    fn test_v2_path() {
        assert_eq!(v2_path("secret/cluster-alpha").unwrap(), "secret/data/cluster-alpha");
        assert_eq!(v2_path("kv/team/cluster").unwrap(), "kv/data/team/cluster");
        assert!(v2_path("secret").is_err());
        assert!(v2_path("/x").is_err());
    }

    #[test]
    fn test_secret_path() {
        assert_eq!(
            secret_path("secret/", "alpha", "machine", NodeRole::ControlPlane),
            "secret/cluster-alpha-machine-controlplane"
        );
    }

    #[test]
    fn test_read_token_file_trims_newline() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join(VAULT_TOKEN_FILE), "s.abc123\n").unwrap();
        assert_eq!(read_token_file(home.path()).unwrap(), "s.abc123");

        let empty = tempfile::tempdir().unwrap();
        assert!(read_token_file(empty.path()).is_err());
    }

    #[tokio::test]
    async fn test_bundle_from_vault() {
        let mut server = mockito::Server::new_async().await;
        let machine = server
            .mock("GET", "/v1/secret/data/cluster-alpha-machine-worker")
            .match_header("x-vault-token", "s.token")
            .with_body(r#"{"data": {"data": {"version": "v1alpha1", "machine": {"type": "worker"}}}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/secret/data/cluster-alpha-patch-worker")
            .with_body(r#"{"data": {"data": {"machine": {"install": {"disk": "/dev/nvme0n1"}}}}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/secret/data/cluster-alpha-node-worker")
            .with_body(NODE_SECRET)
            .create_async()
            .await;

        let client = VaultClient::new(&server.url(), "s.token").unwrap();
        let vault = VaultSource {
            client: &client,
            mount: "secret",
        };
        let bundle = NodeBundle::load("alpha", NodeRole::Worker, &BundleFiles::default(), Some(vault))
            .await
            .unwrap();

        machine.assert_async().await;
        let config: Value = serde_json::from_slice(&bundle.machine_config).unwrap();
        assert_eq!(config["machine"]["type"], "worker");
        assert!(String::from_utf8(bundle.patch).unwrap().contains("/dev/nvme0n1"));
        assert_eq!(bundle.node_config.image_id, "ami-123");
        assert_eq!(bundle.node_config.block_device_name, "/dev/xvda");
    }

    #[tokio::test]
    async fn test_files_take_precedence() {
        let mut server = mockito::Server::new_async().await;
        let machine = server
            .mock("GET", "/v1/secret/data/cluster-alpha-machine-worker")
            .expect(0)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/secret/data/cluster-alpha-patch-worker")
            .with_body(r#"{"data": {"data": {"cluster": {}}}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/secret/data/cluster-alpha-node-worker")
            .with_body(NODE_SECRET)
            .create_async()
            .await;

        let mut machine_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(machine_file, "version: v1alpha1").unwrap();
        let files = BundleFiles {
            machine_config: Some(machine_file.path().to_path_buf()),
            ..Default::default()
        };

        let client = VaultClient::new(&server.url(), "s.token").unwrap();
        let vault = VaultSource {
            client: &client,
            mount: "secret",
        };
        let bundle = NodeBundle::load("alpha", NodeRole::Worker, &files, Some(vault))
            .await
            .unwrap();

        machine.assert_async().await;
        assert_eq!(bundle.machine_config, b"version: v1alpha1\n".to_vec());
    }

    #[tokio::test]
    async fn test_missing_secret_is_backend_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/cluster-alpha-machine-worker")
            .with_status(404)
            .with_body(r#"{"errors": []}"#)
            .create_async()
            .await;

        let client = VaultClient::new(&server.url(), "s.token").unwrap();
        let vault = VaultSource {
            client: &client,
            mount: "secret",
        };
        let err = NodeBundle::load("alpha", NodeRole::Worker, &BundleFiles::default(), Some(vault))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Backend { operation: "read secret", .. }));
    }

    #[tokio::test]
    async fn test_no_source_is_configuration_invalid() {
        let err = NodeBundle::load("alpha", NodeRole::Worker, &BundleFiles::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ConfigurationInvalid(_)));
    }
}
