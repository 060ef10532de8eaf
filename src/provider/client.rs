use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use super::error::ProviderError;
use super::types::{ActiveJobs, CreatedJob, RemoteJobStatus, VerificationRequest, outbound};
use crate::job::MessageBlock;
use crate::poller::VerificationAuthority;
use crate::runner::{StepExecutor, StepReceipt};

/// HTTP client for the WhatsApp provider: message sending and number verification.
pub struct ProviderClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(60))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key: api_key.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .header("apikey", &self.api_key)
            .json(body)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .header("apikey", &self.api_key)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn command(&self, job_id: i64, verb: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url(&format!("verification/jobs/{job_id}/{verb}")))
            .header("apikey", &self.api_key)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Maps 429 and other non-success statuses to [`ProviderError`].
async fn check(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ProviderError::ApiError {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
}

#[async_trait]
impl StepExecutor for ProviderClient {
    async fn execute(
        &self,
        channel: &str,
        destination: &str,
        block: &MessageBlock,
    ) -> Result<StepReceipt, ProviderError> {
        let (endpoint, body) = outbound(destination, block);
        let response: serde_json::Value = self
            .post_json(&format!("message/{endpoint}/{channel}"), &body)
            .await?;
        Ok(StepReceipt {
            body: Some(response),
        })
    }
}

#[async_trait]
impl VerificationAuthority for ProviderClient {
    async fn create_job(&self, request: &VerificationRequest) -> Result<i64, ProviderError> {
        let body = serde_json::to_value(request).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let created: CreatedJob = self.post_json("verification/jobs", &body).await?;
        Ok(created.job_id)
    }

    async fn fetch_status(&self, job_id: i64) -> Result<RemoteJobStatus, ProviderError> {
        self.get_json(&format!("verification/jobs/{job_id}")).await
    }

    async fn list_active(&self) -> Result<Vec<i64>, ProviderError> {
        let active: ActiveJobs = self.get_json("verification/jobs?state=active").await?;
        Ok(active.jobs.into_iter().map(|job| job.id).collect())
    }

    async fn pause(&self, job_id: i64) -> Result<(), ProviderError> {
        self.command(job_id, "pause").await
    }

    async fn resume(&self, job_id: i64) -> Result<(), ProviderError> {
        self.command(job_id, "resume").await
    }

    async fn cancel(&self, job_id: i64) -> Result<(), ProviderError> {
        self.command(job_id, "cancel").await
    }
}
