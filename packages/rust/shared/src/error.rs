//! Error types for the ingestion pipeline.
//!
//! Library crates use [`RunbookError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum RunbookError {
    /// Missing domain, missing crawl configuration, or an invalid config value.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed event payload or a record that violates its invariants.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Fetch/extract/persist failure after the artifact was reserved.
    #[error("scrape of {url} failed: {source}")]
    Scrape {
        url: String,
        #[source]
        source: Box<RunbookError>,
    },

    /// Network/HTTP error while fetching a page.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or response decoding error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM call or structured-output error.
    #[error("llm error: {0}")]
    Llm(String),

    /// Embedding service error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RunbookError>;

impl RunbookError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a failure that happened after a URL was reserved for scraping.
    pub fn scrape(url: impl Into<String>, source: RunbookError) -> Self {
        Self::Scrape {
            url: url.into(),
            source: Box::new(source),
        }
    }

    /// Whether a workflow engine should re-attempt the failed job.
    ///
    /// Config and validation errors are fatal to the invocation; everything
    /// else is assumed transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config { .. } | Self::Validation { .. } => false,
            Self::Scrape { source, .. } => source.is_retryable(),
            _ => true,
        }
    }
}
