//! Generation providers: the slow external call a job waits on.
//!
//! Vendor SDKs live outside this crate; anything that can turn an opaque
//! request into an artifact reference implements [`GenerationProvider`].

mod http;

pub use http::{HttpGenerationProvider, HttpProviderConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::jobs::state::GenerationRequest;

/// Output of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Identifier or URL of the produced artifact.
    pub result_ref: String,
}

impl Artifact {
    pub fn new(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: result_ref.into(),
        }
    }
}

/// A slow generation backend (music, image, chat...).
///
/// Calls may not be abortable. Workers stop waiting on cancellation and drop
/// the future; late results are discarded by the job store.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Run one generation.
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, ProviderError>;
}
