use crate::settings::OpenStackConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

/// Source of hypervisor, server and flavor listings
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// List all hypervisors with their capacity and usage counters
    async fn list_hypervisors(&self) -> Result<Vec<HypervisorDetail>>;

    /// List one page of servers across all tenants, starting after `marker`
    async fn list_servers(
        &self,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ServerDetail>>;

    /// List all flavors, including non-public ones
    async fn list_flavors(&self) -> Result<Vec<FlavorDetail>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorDetail {
    pub id: u64,
    pub hypervisor_hostname: String,
    pub status: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub vcpus_used: i64,
    pub memory_mb_used: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerDetail {
    pub id: String,
    pub name: String,
    pub status: String,
    pub flavor: FlavorRef,
    #[serde(rename = "OS-EXT-SRV-ATTR:hypervisor_hostname")]
    pub hypervisor_hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlavorRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlavorDetail {
    pub id: String,
    pub ram: u64,
    pub vcpus: u32,
}

#[derive(Deserialize)]
struct HypervisorList {
    hypervisors: Vec<HypervisorDetail>,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<ServerDetail>,
}

#[derive(Deserialize)]
struct FlavorList {
    flavors: Vec<FlavorDetail>,
}

/// Nova client over a Keystone token session
pub struct NovaApi {
    client: Client,
    compute_url: String,
}

impl NovaApi {
    /// Authenticate against Keystone v3 with the password method and build a
    /// client carrying the issued token
    pub async fn login(config: &OpenStackConfig) -> Result<Self> {
        let auth = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": config.username,
                            "domain": { "name": "Default" },
                            "password": config.password,
                        }
                    }
                },
                "scope": {
                    "project": { "id": config.project_id }
                }
            }
        });

        let auth_url = format!("{}/auth/tokens", config.auth_url.trim_end_matches('/'));
        debug!(">> POST {}", auth_url);
        let rsp = Client::new().post(&auth_url).json(&auth).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            bail!("POST {}: {}", auth_url, status);
        }
        let token = rsp
            .headers()
            .get("x-subject-token")
            .context("keystone response carries no subject token")?
            .to_str()?
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", token.parse()?);
        let client = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            compute_url: config.compute_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(">> GET {}", path);
        let rsp = self
            .client
            .get(format!("{}{}", self.compute_url, path))
            .send()
            .await?;
        let status = rsp.status();
        let text = rsp.text().await?;
        #[cfg(debug_assertions)]
        debug!("<< {}", text);
        if status.is_success() {
            Ok(serde_json::from_str(&text)?)
        } else {
            bail!("GET {}: {}: {}", path, status, text);
        }
    }
}

#[async_trait]
impl ComputeApi for NovaApi {
    async fn list_hypervisors(&self) -> Result<Vec<HypervisorDetail>> {
        let list: HypervisorList = self.get("/os-hypervisors/detail").await?;
        Ok(list.hypervisors)
    }

    async fn list_servers(
        &self,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ServerDetail>> {
        let path = match marker {
            Some(m) => format!("/servers/detail?all_tenants=1&limit={}&marker={}", limit, m),
            None => format!("/servers/detail?all_tenants=1&limit={}", limit),
        };
        let list: ServerList = self.get(&path).await?;
        Ok(list.servers)
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorDetail>> {
        let list: FlavorList = self.get("/flavors/detail?is_public=None").await?;
        Ok(list.flavors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_detail_reads_nova_payload() {
        let raw = r#"{
            "id": "b8b357f7-3dc5-4b56-9a56-7b8c0f3be222",
            "name": "web1",
            "status": "ACTIVE",
            "flavor": { "id": "42" },
            "OS-EXT-SRV-ATTR:hypervisor_hostname": "hv1.example.org"
        }"#;
        let detail: ServerDetail = serde_json::from_str(raw).unwrap();
        assert_eq!(detail.flavor.id, "42");
        assert_eq!(detail.hypervisor_hostname.as_deref(), Some("hv1.example.org"));
    }

    #[test]
    fn hypervisor_hostname_may_be_null() {
        let raw = r#"{
            "id": "c8b357f7-0000-4b56-9a56-7b8c0f3be222",
            "name": "shelved",
            "status": "SHUTOFF",
            "flavor": { "id": "42" },
            "OS-EXT-SRV-ATTR:hypervisor_hostname": null
        }"#;
        let detail: ServerDetail = serde_json::from_str(raw).unwrap();
        assert!(detail.hypervisor_hostname.is_none());
    }
}
