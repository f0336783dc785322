//! Client for a Nomic-style text embedding endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use runbook_shared::{Embedder, EmbeddingConfig, Result, RunbookError, api_key};

const TASK_TYPE: &str = "search_document";

pub struct NomicEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    dimensionality: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for NomicEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NomicEmbedder")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensionality", &self.dimensionality)
            .finish()
    }
}

impl NomicEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RunbookError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensionality: config.dimensionality,
            client,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(config, api_key(&config.api_key_env)?)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    texts: &'a [String],
    task_type: &'a str,
    dimensionality: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for NomicEmbedder {
    #[instrument(skip_all, fields(texts = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/embedding/text", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                texts,
                task_type: TASK_TYPE,
                dimensionality: self.dimensionality,
            })
            .send()
            .await
            .map_err(|e| RunbookError::Embedding(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RunbookError::Embedding(format!("API error ({status}): {body}")));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RunbookError::Embedding(format!("failed to parse response: {e}")))?;

        if body.embeddings.len() != texts.len() {
            return Err(RunbookError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        debug!("embedded batch");
        Ok(body.embeddings)
    }
}
