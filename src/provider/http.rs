//! Generic HTTP provider: POSTs the request JSON to an endpoint.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Artifact, GenerationProvider};
use crate::error::ProviderError;
use crate::jobs::state::GenerationRequest;

/// Configuration for [`HttpGenerationProvider`].
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<SecretString>,
}

impl HttpProviderConfig {
    /// Read `GENJOB_PROVIDER_URL` / `GENJOB_PROVIDER_API_KEY`. Returns `None`
    /// when no endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("GENJOB_PROVIDER_URL").ok()?;
        let api_key = std::env::var("GENJOB_PROVIDER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let name = std::env::var("GENJOB_PROVIDER_NAME").unwrap_or_else(|_| "http".to_string());
        Some(Self {
            name,
            endpoint,
            api_key,
        })
    }
}

/// Response body accepted from the endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    result_ref: Option<String>,
    url: Option<String>,
}

/// Provider that forwards the opaque request to an HTTP endpoint and reads
/// `resultRef` (or `url`) from the JSON reply.
pub struct HttpGenerationProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpGenerationProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, ProviderError> {
        let mut builder = self.client.post(&self.config.endpoint).json(request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| ProviderError::RequestFailed {
            provider: self.config.name.clone(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed {
                provider: self.config.name.clone(),
                reason: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            });
        }

        let body: GenerateResponse =
            resp.json().await.map_err(|e| ProviderError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: e.to_string(),
            })?;

        body.result_ref
            .or(body.url)
            .filter(|r| !r.is_empty())
            .map(Artifact::new)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: "response carried neither resultRef nor url".to_string(),
            })
    }
}
