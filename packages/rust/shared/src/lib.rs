//! Shared types, error model, and configuration for the runbook pipeline.
//!
//! This crate is the foundation depended on by all other runbook crates.
//! It provides:
//! - [`RunbookError`], the unified error type
//! - Persisted records ([`Artifact`], [`ArtifactContent`], cluster types)
//! - Pipeline [`Event`]s
//! - Configuration ([`AppConfig`], [`DomainConfig`], config loading)
//! - Collaborator traits in [`contracts`]

pub mod config;
pub mod contracts;
pub mod error;
pub mod events;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DomainConfig, EmbeddingConfig, EngineConfig, LlmConfig, ScraperConfig,
    ScrapingConfig, StorageConfig, UrlFilter, api_key, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_api_keys,
};
pub use contracts::{
    ClusterDetector, Embedder, EventSink, Extraction, ExtractionRequest, Extractor, LlmClient,
    ScrapedLink, ScrapedPage, ScrapedSection, Scraper,
};
pub use error::{Result, RunbookError};
pub use events::{DEFAULT_REINGEST_CHUNK_SIZE, Event};
pub use types::{
    Artifact, ArtifactContent, ArtifactLink, ClusterInfo, ClusterNode, CrawlRequest, CrawlStatus, Domain,
    NewArtifactContent, PriorCluster, SampledArtifact, TopLevelCluster, TopicSummary,
    new_artifact_id,
};
