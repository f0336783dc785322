//! Traits for the external collaborators of the pipeline.
//!
//! Every handle is passed explicitly as `&dyn Trait`, so tests can swap in
//! fakes without touching the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ScrapingConfig;
use crate::error::Result;
use crate::events::Event;
use crate::types::ClusterNode;

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// A hyperlink found inside a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedLink {
    pub url: String,
    pub anchor_text: String,
}

/// One structural section of a fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedSection {
    pub anchor_id: String,
    pub title: String,
    /// Section body as Markdown.
    pub content: String,
    pub links: Vec<ScrapedLink>,
}

/// A fetched and parsed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedPage {
    /// Final URL after redirects.
    pub url: String,
    pub title: String,
    /// Whole page as Markdown. The content hash is taken over this.
    pub full_text: String,
    pub sections: Vec<ScrapedSection>,
}

/// Fetches a URL and cuts it into sections.
///
/// Implementations retry transient network failures internally before
/// surfacing an error.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn fetch_and_parse(&self, url: &str, config: &ScrapingConfig) -> Result<ScrapedPage>;
}

// ---------------------------------------------------------------------------
// Extractor / LLM
// ---------------------------------------------------------------------------

/// Input of one structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub title: String,
    pub content: String,
    /// Instructions for the model.
    pub prompt: String,
    /// JSON schema the result must follow.
    pub schema: Value,
    /// Surrounding context, e.g. the page summary when extracting a section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Result of a structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub summary: String,
    /// Everything the model returned.
    pub metadata: Value,
}

/// Structured extraction over a page or a section.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest) -> Result<Extraction>;
}

/// Chat model returning JSON that follows a schema.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str, schema: &Value) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// Text embedding service. One call embeds the whole batch.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// Scheduling / clustering
// ---------------------------------------------------------------------------

/// Schedules follow-up jobs and returns one id per event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn enqueue(&self, events: Vec<Event>) -> Result<Vec<String>>;
}

/// The external clustering run for a domain.
#[async_trait]
pub trait ClusterDetector: Send + Sync {
    /// A fresh hierarchy for the domain, or `None` to keep what is stored.
    async fn detect(&self, domain_id: &str) -> Result<Option<Vec<ClusterNode>>>;
}
