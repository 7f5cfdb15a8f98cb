//! HTTP client for a running arbord.
//!
//! Every request carries the caller's identity in the requestor header; the
//! daemon only lets the identity that started an operation cancel it.

use anyhow::{anyhow, Context, Result};
use arbor_daemon::http::{RepoBody, StartBody, StartedBody, WaitBody};
use arbor_daemon::{OperationId, OperationInfo, REQUESTOR_HEADER};

pub struct DaemonClient {
    base_url: String,
    requestor: String,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Create a new client targeting `base_url` (e.g. `http://127.0.0.1:7468`)
    pub fn new(base_url: &str, requestor: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            requestor: requestor.to_string(),
            http: reqwest::Client::builder()
                .build()
                .context("Failed to create HTTP client")?,
        })
    }

    /// POST /operations
    pub async fn start(&self, body: &StartBody) -> Result<OperationId> {
        let url = format!("{}/operations", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header(REQUESTOR_HEADER, &self.requestor)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let started: StartedBody = Self::parse(resp, "POST /operations").await?;
        Ok(started.id)
    }

    /// DELETE /operations/{id}
    pub async fn cancel(&self, id: OperationId) -> Result<()> {
        let url = format!("{}/operations/{}", self.base_url, id);
        let resp = self
            .http
            .delete(&url)
            .header(REQUESTOR_HEADER, &self.requestor)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let _: StartedBody = Self::parse(resp, "DELETE /operations").await?;
        Ok(())
    }

    /// GET /operations/{id}/wait
    pub async fn wait(&self, id: OperationId) -> Result<WaitBody> {
        let url = format!("{}/operations/{}/wait", self.base_url, id);
        let resp = self
            .http
            .get(&url)
            .header(REQUESTOR_HEADER, &self.requestor)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::parse(resp, "GET /operations/{id}/wait").await
    }

    /// GET /operations
    pub async fn list(&self) -> Result<Vec<OperationInfo>> {
        let url = format!("{}/operations", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::parse(resp, "GET /operations").await
    }

    /// GET /repo
    pub async fn repo(&self) -> Result<RepoBody> {
        let url = format!("{}/repo", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Self::parse(resp, "GET /repo").await
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(body);
            return Err(anyhow!("{} failed ({}): {}", what, status, detail));
        }
        resp.json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

/// Identity used when `--requestor` is not given.
///
/// Stable across invocations so a later `remote cancel` matches `remote start`.
pub fn default_requestor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
