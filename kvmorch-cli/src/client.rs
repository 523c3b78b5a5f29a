//! HTTP client for the node daemon API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One row of `GET /vms`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmRow {
    pub name: String,
    pub state: String,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
struct VmList {
    vms: Vec<VmRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpAnswer {
    pub ip: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVm {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub network: String,
    pub ssh_pubkey: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Created {
    pub message: String,
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message: String,
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: &str) -> Result<Self> {
        // Create waits for the guest address, which can take minutes.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn list(&self) -> Result<Vec<VmRow>> {
        let response = self.get("/vms").await?;
        let list: VmList = checked(response).await?.json().await?;
        Ok(list.vms)
    }

    /// `None` when the daemon found no address.
    pub async fn ip(&self, name: &str) -> Result<Option<IpAnswer>> {
        let response = self.get(&format!("/vms/{}/ip", name)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(checked(response).await?.json().await?))
    }

    pub async fn power(&self, name: &str, action: &str) -> Result<String> {
        let url = self.url(&format!("/vms/{}/{}", name, action));
        debug!(url = %url, "POST");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        message(response).await
    }

    pub async fn delete(&self, name: &str) -> Result<String> {
        let url = self.url(&format!("/vms/{}", name));
        debug!(url = %url, "DELETE");
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        message(response).await
    }

    pub async fn create(&self, request: &CreateVm) -> Result<Created> {
        let url = self.url("/vms");
        debug!(url = %url, vm = %request.name, "POST");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        Ok(checked(response).await?.json().await?)
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))
    }
}

/// Pass successful responses through, turn the rest into errors carrying
/// the daemon's message.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Message>(&body)
        .map(|m| m.message)
        .unwrap_or(body);

    if status == StatusCode::CONFLICT {
        bail!("{}", detail);
    }
    bail!("API error ({}): {}", status, detail)
}

async fn message(response: Response) -> Result<String> {
    let body: Message = checked(response).await?.json().await?;
    Ok(body.message)
}
