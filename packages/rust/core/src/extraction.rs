//! Structured extraction of page and section summaries through an LLM.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use runbook_shared::{
    Extraction, ExtractionRequest, Extractor, LlmClient, Result, RunbookError, ScrapedPage,
    ScrapedSection,
};

/// Instructions sent with every extraction.
pub const EXTRACTION_PROMPT: &str = "Extract the title, summary, and main_sections. \
The summary should be a couple of sentences covering what the content is about and what \
a reader would use it for. For each main section give its heading and a one sentence \
summary of its content. Set is_deprecated when the content says it is deprecated or \
superseded, and new_version_url to the replacement when one is linked.";

/// Content beyond this many characters is cut before it reaches the model.
pub const MAX_EXTRACTION_CHARS: usize = 50_000;

const SYSTEM_PROMPT: &str =
    "You extract structured information from technical documentation. Respond with JSON only.";

/// JSON schema of the extracted artifact metadata.
pub fn artifact_metadata_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "summary": { "type": "string" },
            "main_sections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "heading": { "type": "string" },
                        "content_summary": { "type": "string" }
                    },
                    "required": ["heading", "content_summary"],
                    "additionalProperties": false
                }
            },
            "is_deprecated": { "type": "boolean" },
            "new_version_url": { "type": ["string", "null"] }
        },
        "required": ["title", "summary", "main_sections", "is_deprecated", "new_version_url"],
        "additionalProperties": false
    })
}

/// Extraction request for a whole page.
pub fn page_request(page: &ScrapedPage) -> ExtractionRequest {
    ExtractionRequest {
        title: page.title.clone(),
        content: page.full_text.clone(),
        prompt: EXTRACTION_PROMPT.to_string(),
        schema: artifact_metadata_schema(),
        context: None,
    }
}

/// Extraction request for one section, with the page summary as context.
pub fn section_request(section: &ScrapedSection, page_summary: &str) -> ExtractionRequest {
    ExtractionRequest {
        title: section.title.clone(),
        content: section.content.clone(),
        prompt: EXTRACTION_PROMPT.to_string(),
        schema: artifact_metadata_schema(),
        context: Some(page_summary.to_string()),
    }
}

/// [`Extractor`] backed by any [`LlmClient`].
pub struct LlmExtractor {
    llm: Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    #[instrument(skip_all, fields(title = %request.title))]
    async fn extract(&self, request: ExtractionRequest) -> Result<Extraction> {
        let mut prompt = format!("{}\n\nTitle: {}\n", request.prompt, request.title);
        if let Some(context) = &request.context {
            prompt.push_str(&format!("\nThe page this section belongs to: {context}\n"));
        }
        prompt.push_str("\nContent:\n");
        prompt.push_str(truncate_chars(&request.content, MAX_EXTRACTION_CHARS));

        let metadata = self.llm.generate(SYSTEM_PROMPT, &prompt, &request.schema).await?;
        let summary = metadata
            .get("summary")
            .and_then(Value::as_str)
            .ok_or_else(|| RunbookError::Llm("extraction has no summary".into()))?
            .to_string();

        Ok(Extraction { summary, metadata })
    }
}

/// The first `max` characters of `text`.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
