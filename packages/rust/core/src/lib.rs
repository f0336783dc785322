//! Core ingestion pipeline for runbook.
//!
//! This crate holds the handlers the step engine dispatches events to:
//! the crawl state machine ([`crawl`]), the resume sweep ([`resume`]), the
//! cluster workflow and summarizer ([`cluster`], [`summarizer`]) and batch
//! re-ingestion ([`reingest`]). It also carries the HTTP clients for the LLM
//! and embedding services.

use std::sync::Arc;

use runbook_shared::{ClusterDetector, Embedder, Extractor, LlmClient, Scraper};

pub mod cluster;
pub mod crawl;
pub mod embedding;
pub mod engine;
pub mod extraction;
pub mod llm;
pub mod reingest;
pub mod resume;
pub mod summarizer;

#[cfg(test)]
mod testing;

pub use cluster::{JsonFileDetector, StoredClusters, cluster_domain};
pub use crawl::{CrawlOutcome, SkipReason, process};
pub use embedding::NomicEmbedder;
pub use engine::{DrainReport, FailedJob, JobOutput, Journal, LocalEngine, StepContext};
pub use extraction::LlmExtractor;
pub use llm::OpenRouterClient;
pub use reingest::reingest_domain;
pub use resume::resume_crawl;
pub use summarizer::ClusterSummarizer;

/// External services a job handler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn Scraper>,
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LlmClient>,
    pub detector: Arc<dyn ClusterDetector>,
}

/// Title of a chunk: its first line without heading markers.
pub(crate) fn chunk_title(chunk: &str) -> String {
    chunk
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .trim_start_matches('#')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_titles_drop_heading_markers() {
        assert_eq!(chunk_title("## Install\n\nRun it."), "Install");
        assert_eq!(chunk_title("\nPlain first line\nmore"), "Plain first line");
        assert_eq!(chunk_title(""), "");
    }
}
