//! Events that drive the pipeline.
//!
//! On the wire an event is `{"name": "...", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunbookError};
use crate::types::CrawlRequest;

/// Default chunk size for batch re-ingestion.
pub const DEFAULT_REINGEST_CHUNK_SIZE: usize = 512;

/// A unit of work for the step engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum Event {
    /// Crawl one URL at a depth.
    #[serde(rename = "app/url.added")]
    CrawlRequested(CrawlRequest),

    /// Re-submit every unfinished artifact of a domain.
    #[serde(rename = "app/crawl.resume")]
    ResumeCrawl { domain_id: String },

    /// Detect clusters and summarize the top-level ones.
    #[serde(rename = "app/cluster.artifacts")]
    ClusterArtifacts { domain_id: String },

    /// Copy a domain's scraped pages into a second domain, then re-chunk and
    /// re-embed them there.
    #[serde(rename = "app/domain.reingest")]
    ReingestDomain {
        source_domain_id: String,
        target_domain_id: String,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },
}

fn default_chunk_size() -> usize {
    DEFAULT_REINGEST_CHUNK_SIZE
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CrawlRequested(_) => "app/url.added",
            Self::ResumeCrawl { .. } => "app/crawl.resume",
            Self::ClusterArtifacts { .. } => "app/cluster.artifacts",
            Self::ReingestDomain { .. } => "app/domain.reingest",
        }
    }

    /// Key under which two in-flight jobs must not run together.
    pub fn concurrency_key(&self) -> &str {
        match self {
            Self::CrawlRequested(request) => &request.url,
            Self::ResumeCrawl { domain_id } | Self::ClusterArtifacts { domain_id } => domain_id,
            Self::ReingestDomain {
                target_domain_id, ..
            } => target_domain_id,
        }
    }

    /// Parse and validate an event payload.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)
            .map_err(|e| RunbookError::validation(format!("malformed event: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    /// Check payload invariants.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::CrawlRequested(request) => request.validate(),
            Self::ResumeCrawl { domain_id } | Self::ClusterArtifacts { domain_id } => {
                require_domain(domain_id)
            }
            Self::ReingestDomain {
                source_domain_id,
                target_domain_id,
                chunk_size,
            } => {
                require_domain(source_domain_id)?;
                require_domain(target_domain_id)?;
                if source_domain_id == target_domain_id {
                    return Err(RunbookError::validation(
                        "re-ingestion needs a target domain other than its source",
                    ));
                }
                if *chunk_size == 0 {
                    return Err(RunbookError::validation("chunk_size must be positive"));
                }
                Ok(())
            }
        }
    }
}

fn require_domain(domain_id: &str) -> Result<()> {
    if domain_id.trim().is_empty() {
        return Err(RunbookError::validation("event has an empty domain_id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_event_wire_format() {
        let event = Event::CrawlRequested(
            CrawlRequest::new("https://docs.example.com/", 0, "docs").unwrap(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "app/url.added");
        assert_eq!(json["data"]["crawl_depth"], 0);
        assert_eq!(json["data"]["domain_id"], "docs");
    }

    #[test]
    fn parses_valid_events() {
        let event =
            Event::from_json(r#"{"name":"app/crawl.resume","data":{"domain_id":"docs"}}"#).unwrap();
        assert_eq!(
            event,
            Event::ResumeCrawl {
                domain_id: "docs".into()
            }
        );

        let event = Event::from_json(
            r#"{"name":"app/domain.reingest","data":{"source_domain_id":"docs","target_domain_id":"docs-naive"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            Event::ReingestDomain { chunk_size: 512, .. }
        ));
        assert_eq!(event.concurrency_key(), "docs-naive");
    }

    #[test]
    fn malformed_payloads_are_validation_errors() {
        for json in [
            r#"{"name":"app/url.added","data":{"url":"https://x.dev"}}"#,
            r#"{"name":"app/url.added","data":{"url":"https://x.dev","crawl_depth":-1,"domain_id":"d"}}"#,
            r#"{"name":"app/url.added","data":{"url":"","crawl_depth":0,"domain_id":"d"}}"#,
            r#"{"name":"app/unknown","data":{}}"#,
            r#"{"name":"app/cluster.artifacts","data":{"domain_id":""}}"#,
            r#"{"name":"app/domain.reingest","data":{"source_domain_id":"docs","target_domain_id":"docs"}}"#,
        ] {
            let err = Event::from_json(json).unwrap_err();
            assert!(
                matches!(err, RunbookError::Validation { .. }),
                "expected validation error for {json}"
            );
        }
    }

    #[test]
    fn concurrency_key_is_the_url_for_crawls() {
        let event = Event::CrawlRequested(
            CrawlRequest::new("https://docs.example.com/a", 1, "docs").unwrap(),
        );
        assert_eq!(event.concurrency_key(), "https://docs.example.com/a");
        assert_eq!(event.name(), "app/url.added");
    }
}
