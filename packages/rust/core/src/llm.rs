//! Chat-completions client returning schema-shaped JSON.
//!
//! Talks to any OpenAI-compatible endpoint (OpenRouter by default) and asks
//! for a `json_schema` response format.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use runbook_shared::{LlmClient, LlmConfig, Result, RunbookError, api_key};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// LLM client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RunbookError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            client,
        })
    }

    /// Build a client reading the key from `config.api_key_env`.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(config, api_key(&config.api_key_env)?)
    }

    fn build_request(&self, system: &str, prompt: &str, schema: &Value) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                format_type: "json_schema".into(),
                json_schema: JsonSchemaFormat {
                    name: "result".into(),
                    strict: true,
                    schema: schema.clone(),
                },
            },
        }
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model, prompt_len = prompt.len()))]
    async fn generate(&self, system: &str, prompt: &str, schema: &Value) -> Result<Value> {
        let started = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(system, prompt, schema))
            .send()
            .await
            .map_err(|e| RunbookError::Llm(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RunbookError::Llm(format!("API error ({status}): {body}")));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| RunbookError::Llm(format!("failed to parse response: {e}")))?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| RunbookError::Llm("no content in response".into()))?;

        debug!(elapsed_ms = started.elapsed().as_millis(), "completion received");
        serde_json::from_str(strip_code_fence(content))
            .map_err(|e| RunbookError::Llm(format!("response is not valid JSON: {e}")))
    }
}

/// Drop a surrounding ```json fence some models add despite the response format.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
