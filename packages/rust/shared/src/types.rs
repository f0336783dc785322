//! Core domain records for the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::config::DomainConfig;
use crate::error::{Result, RunbookError};

// ---------------------------------------------------------------------------
// CrawlStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`Artifact`].
///
/// `Scraped` is the only stable state. `ScrapeFailed` is picked up again by
/// the resume sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Discovered,
    Scraping,
    Scraped,
    ScrapeFailed,
}

impl CrawlStatus {
    /// Column value stored in the `artifacts` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Scraping => "scraping",
            Self::Scraped => "scraped",
            Self::ScrapeFailed => "scrape_failed",
        }
    }

    /// States the resume sweep re-submits.
    pub fn unfinished() -> [CrawlStatus; 3] {
        [Self::Discovered, Self::Scraping, Self::ScrapeFailed]
    }
}

impl std::fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrawlStatus {
    type Err = RunbookError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "scraping" => Ok(Self::Scraping),
            "scraped" => Ok(Self::Scraped),
            "scrape_failed" => Ok(Self::ScrapeFailed),
            other => Err(RunbookError::validation(format!(
                "unknown crawl status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// A crawl target. `config` is `None` until crawl settings are registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub domain_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DomainConfig>,
}

impl Domain {
    /// The crawl configuration, or a config error naming the domain.
    pub fn crawl_config(&self) -> Result<&DomainConfig> {
        self.config.as_ref().ok_or_else(|| {
            RunbookError::config(format!(
                "domain {} has no crawl configuration",
                self.domain_id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Persisted record of one crawled URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Time-sortable identifier (UUID v7).
    pub artifact_id: String,
    /// Owning domain.
    pub domain_id: String,
    /// Unique key.
    pub url: String,
    pub crawl_status: CrawlStatus,
    /// Best (smallest) depth at which this URL has been reached.
    pub crawl_depth: u32,
    /// SHA-256 of `parsed_text`, set once scraped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Structured page-level extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Canonical artifact when this one is a content duplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_as_artifact_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// Whether this artifact aliases another artifact's content.
    pub fn is_duplicate(&self) -> bool {
        self.crawled_as_artifact_id.is_some()
    }

    /// The artifact whose link set this artifact's page contributes.
    pub fn canonical_id(&self) -> &str {
        self.crawled_as_artifact_id
            .as_deref()
            .unwrap_or(&self.artifact_id)
    }
}

/// Generate a new artifact identifier.
pub fn new_artifact_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// ArtifactContent / ArtifactLink
// ---------------------------------------------------------------------------

/// One structural section of an artifact's page, keyed by `(artifact_id, anchor_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactContent {
    pub artifact_content_id: String,
    pub artifact_id: String,
    pub anchor_id: String,
    pub title: String,
    pub parsed_text: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Upsert payload for an [`ArtifactContent`] row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifactContent {
    pub artifact_id: String,
    pub anchor_id: String,
    pub title: String,
    pub parsed_text: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
}

/// Directed edge from a content section to a target URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    pub source_artifact_content_id: String,
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_text: Option<String>,
}

// ---------------------------------------------------------------------------
// CrawlRequest
// ---------------------------------------------------------------------------

/// "Crawl this URL at this depth for this domain."
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub crawl_depth: u32,
    pub domain_id: String,
}

impl CrawlRequest {
    /// Build a request, rejecting empty or unparseable URLs and empty domains.
    pub fn new(url: impl Into<String>, crawl_depth: u32, domain_id: impl Into<String>) -> Result<Self> {
        let request = Self {
            url: url.into(),
            crawl_depth,
            domain_id: domain_id.into(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the invariants of a request that arrived as an event payload.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(RunbookError::validation("crawl request has an empty url"));
        }
        if self.domain_id.trim().is_empty() {
            return Err(RunbookError::validation(
                "crawl request has an empty domain_id",
            ));
        }
        Url::parse(&self.url).map_err(|e| {
            RunbookError::validation(format!("crawl request url '{}' is invalid: {e}", self.url))
        })?;
        Ok(())
    }

    /// The request for a page linked from this one. The depth saturates at
    /// `u32::MAX`.
    pub fn child(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            crawl_depth: self.crawl_depth.saturating_add(1),
            domain_id: self.domain_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Structured topic summary produced by the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    /// A phrase that describes the main theme of the topic.
    pub main_theme: String,
    /// Phrases that describe key concepts in the topic.
    pub key_concepts: Vec<String>,
}

/// A sampled cluster member used as synthesis input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledArtifact {
    pub artifact_id: String,
    pub title: String,
    pub summary: String,
    pub url: String,
}

/// A child cluster at `iteration - 1` that was merged into the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorCluster {
    pub cluster_id: String,
    pub iteration: u32,
    pub member_count: u32,
}

/// Everything the summarizer needs to know about one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub domain_id: String,
    pub cluster_id: String,
    pub iteration: u32,
    pub member_count: u32,
    pub sample_artifacts: Vec<SampledArtifact>,
    /// Populated only when `iteration > 2`.
    pub prior_clusters: Vec<PriorCluster>,
}

/// A cluster not merged into any later cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopLevelCluster {
    pub cluster_id: String,
    pub iteration: u32,
}

/// One node of an externally computed cluster hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub cluster_id: String,
    pub iteration: u32,
    /// Member artifact ids.
    #[serde(default)]
    pub members: Vec<String>,
    /// Cluster ids at `iteration - 1` merged into this node.
    #[serde(default)]
    pub prior_clusters: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_status_roundtrip() {
        for status in [
            CrawlStatus::Discovered,
            CrawlStatus::Scraping,
            CrawlStatus::Scraped,
            CrawlStatus::ScrapeFailed,
        ] {
            let parsed: CrawlStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<CrawlStatus>().is_err());
    }

    #[test]
    fn crawl_status_serializes_snake_case() {
        let json = serde_json::to_string(&CrawlStatus::ScrapeFailed).unwrap();
        assert_eq!(json, r#""scrape_failed""#);
    }

    #[test]
    fn crawl_request_rejects_bad_input() {
        assert!(CrawlRequest::new("", 0, "docs").is_err());
        assert!(CrawlRequest::new("not a url", 0, "docs").is_err());
        assert!(CrawlRequest::new("https://docs.example.com", 0, " ").is_err());
        assert!(CrawlRequest::new("https://docs.example.com", 2, "docs").is_ok());
    }

    #[test]
    fn child_request_is_one_hop_deeper() {
        let parent = CrawlRequest::new("https://docs.example.com", 2, "docs").unwrap();
        let child = parent.child("https://docs.example.com/a");
        assert_eq!(child.crawl_depth, 3);
        assert_eq!(child.domain_id, "docs");

        let deepest = CrawlRequest::new("https://docs.example.com", u32::MAX, "docs").unwrap();
        assert_eq!(deepest.child("https://docs.example.com/a").crawl_depth, u32::MAX);
    }

    #[test]
    fn cluster_node_defaults() {
        let node: ClusterNode =
            serde_json::from_str(r#"{"cluster_id":"c1","iteration":1}"#).unwrap();
        assert!(node.members.is_empty());
        assert!(node.prior_clusters.is_empty());
    }
}
