//! Cloudflare v4 DNS client

use super::{async_trait, DnsApi};
use crate::models::ClusterNode;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4/";

/// Largest page `dns_records` accepts
const RECORDS_PER_PAGE: &str = "100";

/// DNS records managed in one Cloudflare zone
#[derive(Debug, Clone)]
pub struct CloudflareDns {
    client: reqwest::Client,
    base_url: Url,
    zone_id: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

impl CloudflareDns {
    pub fn new(base_url: &str, zone_id: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        // Url::join drops the last path segment unless it ends with a slash
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&base).context("Invalid Cloudflare API URL")?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            zone_id: zone_id.into(),
            api_token: api_token.into(),
        })
    }

    /// Build from `CLOUDFLARE_ZONE_ID` and `CLOUDFLARE_API_TOKEN`
    pub fn from_env() -> Result<Self> {
        let zone_id = std::env::var("CLOUDFLARE_ZONE_ID").context("CLOUDFLARE_ZONE_ID is not set")?;
        let api_token =
            std::env::var("CLOUDFLARE_API_TOKEN").context("CLOUDFLARE_API_TOKEN is not set")?;
        Self::new(DEFAULT_CLOUDFLARE_API, zone_id, api_token)
    }

    fn records_url(&self, record_id: Option<&str>) -> Result<Url> {
        let path = match record_id {
            Some(id) => format!("zones/{}/dns_records/{}", self.zone_id, id),
            None => format!("zones/{}/dns_records", self.zone_id),
        };
        self.base_url.join(&path).context("Failed to build URL")
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, request: reqwest::RequestBuilder) -> Result<Option<T>> {
        Ok(self.call(request).await?.result)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse<T>> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response body")?;
        if !status.is_success() {
            bail!("Cloudflare API error ({}): {}", status, body);
        }

        let parsed: ApiResponse<T> =
            serde_json::from_str(&body).context("Failed to parse Cloudflare response")?;
        if !parsed.success {
            let errors: Vec<String> = parsed
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect();
            bail!("Cloudflare API error: {}", errors.join("; "));
        }
        Ok(parsed)
    }

    /// Every matching record, following `result_info.total_pages`
    async fn list_records(&self, query: &[(&str, &str)]) -> Result<Vec<DnsRecord>> {
        let url = self.records_url(None)?;
        let mut records = Vec::new();
        let mut page = 1u32;
        loop {
            let page_param = page.to_string();
            let response: ApiResponse<Vec<DnsRecord>> = self
                .call(
                    self.client
                        .get(url.clone())
                        .query(query)
                        .query(&[("per_page", RECORDS_PER_PAGE), ("page", page_param.as_str())]),
                )
                .await?;
            records.extend(response.result.unwrap_or_default());

            let total_pages = response.result_info.map_or(1, |info| info.total_pages);
            if page >= total_pages {
                break;
            }
            page += 1;
        }
        Ok(records)
    }
}

#[async_trait]
impl DnsApi for CloudflareDns {
    async fn register_node(&self, node: &dyn ClusterNode) -> Result<()> {
        let fqdn = node.fqdn();
        let body = RecordBody {
            record_type: "A",
            name: &fqdn,
            content: node.ip(),
            ttl: 1,
            proxied: false,
        };

        let existing = self
            .list_records(&[("type", "A"), ("name", fqdn.as_str())])
            .await?;

        match existing.first() {
            Some(record) => {
                let url = self.records_url(Some(&record.id))?;
                let _: Option<DnsRecord> = self.send(self.client.put(url).json(&body)).await?;
                info!(record = %fqdn, address = %node.ip(), "Overwrote DNS record");
            }
            None => {
                let url = self.records_url(None)?;
                let _: Option<DnsRecord> = self.send(self.client.post(url).json(&body)).await?;
                info!(record = %fqdn, address = %node.ip(), "Created DNS record");
            }
        }
        Ok(())
    }

    async fn deregister_node(&self, name: &str) -> Result<usize> {
        let records = self.list_records(&[("name.contains", name)]).await?;
        for record in &records {
            let url = self.records_url(Some(&record.id))?;
            let _: Option<serde_json::Value> = self.send(self.client.delete(url)).await?;
            debug!(record = %record.name, id = %record.id, "Deleted DNS record");
        }
        info!(name = %name, removed = records.len(), "Removed DNS records");
        Ok(records.len())
    }
}
