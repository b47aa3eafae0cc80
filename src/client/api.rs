//! Client view of the job service.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::jobs::state::{CreatedJob, GenerationRequest, JobState, JobStatus};

/// What a client needs from the job service.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn create(&self, request: &GenerationRequest) -> Result<CreatedJob, ClientError>;

    /// `ClientError::NotFound` means the job is gone and must not be retried.
    async fn status(&self, job_id: Uuid) -> Result<JobStatus, ClientError>;

    async fn cancel(&self, job_id: Uuid) -> Result<JobState, ClientError>;

    /// Current server process epoch (ms since the Unix epoch).
    async fn server_epoch(&self) -> Result<i64, ClientError>;
}

#[derive(Deserialize)]
struct CancelResponse {
    state: JobState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpochResponse {
    server_epoch: i64,
}

/// `JobApi` over HTTP.
pub struct HttpJobApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_url.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Decode a 2xx JSON body, mapping 404 to `NotFound` for `job_id`.
    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        job_id: Option<Uuid>,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Some(id) = job_id {
                return Err(ClientError::NotFound { id });
            }
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn create(&self, request: &GenerationRequest) -> Result<CreatedJob, ClientError> {
        let resp = self.client.post(self.url("/jobs")).json(request).send().await?;
        match Self::decode(resp, None).await {
            Err(ClientError::Http { status, body }) if (400..500).contains(&status) => {
                Err(ClientError::Rejected(body))
            }
            other => other,
        }
    }

    async fn status(&self, job_id: Uuid) -> Result<JobStatus, ClientError> {
        let resp = self
            .client
            .get(self.url(&format!("/jobs/{job_id}/status")))
            .send()
            .await?;
        Self::decode(resp, Some(job_id)).await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<JobState, ClientError> {
        let resp = self
            .client
            .post(self.url(&format!("/jobs/{job_id}/cancel")))
            .send()
            .await?;
        let body: CancelResponse = Self::decode(resp, Some(job_id)).await?;
        Ok(body.state)
    }

    async fn server_epoch(&self) -> Result<i64, ClientError> {
        let resp = self.client.get(self.url("/epoch")).send().await?;
        let body: EpochResponse = Self::decode(resp, None).await?;
        Ok(body.server_epoch)
    }
}
