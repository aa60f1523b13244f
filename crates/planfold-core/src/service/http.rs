//! HTTP/JSON transport for remote plan-creation services.
//!
//! Each batch is sent as `POST {base_url}/plan-creation` with a
//! [`PlanCreationBatchRequest`] body; the response body is a
//! [`ServiceAnswer`]. Non-2xx statuses and undecodable bodies are transport
//! failures.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use planfold_types::models::{PlanCreationBatchRequest, ServiceAnswer};

use super::client::PlanCreatorClient;

/// Client for a plan-creation service reachable over HTTP.
pub struct HttpPlanCreatorClient {
    /// Base URL without trailing slash (e.g. `http://cd-service:8080`).
    base_url: String,
    client: reqwest::Client,
}

impl HttpPlanCreatorClient {
    /// Path appended to the base URL for every batch.
    pub const ENDPOINT: &str = "plan-creation";

    /// Create a client. `request_timeout` bounds a single HTTP exchange.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("service URL must start with http:// or https://, got: {base_url:?}");
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_url(&self) -> String {
        format!("{}/{}", self.base_url, Self::ENDPOINT)
    }
}

#[async_trait]
impl PlanCreatorClient for HttpPlanCreatorClient {
    async fn create_plan(&self, request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
        let url = self.endpoint_url();

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{url} returned {status}: {body}");
        }

        response
            .json::<ServiceAnswer>()
            .await
            .with_context(|| format!("invalid plan creation answer from {url}"))
    }
}
