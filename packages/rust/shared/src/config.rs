//! Application and per-domain configuration.
//!
//! App config lives at `~/.runbook/runbook.toml`; a missing file means
//! defaults. Domain config is stored with each domain row as JSON and decides
//! what the crawler may follow and how deep.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunbookError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "runbook.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".runbook";

// ---------------------------------------------------------------------------
// App config (runbook.toml)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.runbook/runbook.db".into()
}

/// `[llm]` section: an OpenRouter-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_key_env(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: 0.0,
        }
    }
}

fn default_llm_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_model() -> String {
    "openai/gpt-4o-mini".into()
}

/// `[embedding]` section: a Nomic-style text embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimensionality")]
    pub dimensionality: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_embedding_key_env(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            dimensionality: default_dimensionality(),
        }
    }
}

fn default_embedding_key_env() -> String {
    "NOMIC_API_KEY".into()
}
fn default_embedding_base_url() -> String {
    "https://api-atlas.nomic.ai".into()
}
fn default_embedding_model() -> String {
    "nomic-embed-text-v1.5".into()
}
fn default_dimensionality() -> u32 {
    768
}

/// `[scraper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Attempts per fetch before the error is surfaced.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Allow loopback and private hosts. Off outside of tests.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
        }
    }
}

fn default_retry_limit() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("runbook/{}", env!("CARGO_PKG_VERSION"))
}

/// `[engine]` section: retry policy of the local work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `n * backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Domain config (stored per domain)
// ---------------------------------------------------------------------------

/// Crawl and clustering policy of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Regexes matched at the start of a URL. Empty means unrestricted.
    #[serde(default)]
    pub allowed_url_patterns: Vec<String>,
    #[serde(default = "default_max_crawl_depth")]
    pub max_crawl_depth: u32,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: u32,
    #[serde(default)]
    pub crawler_disabled: bool,
    #[serde(default)]
    pub scraping: ScrapingConfig,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            allowed_url_patterns: Vec::new(),
            max_crawl_depth: default_max_crawl_depth(),
            min_cluster_size: default_min_cluster_size(),
            crawler_disabled: false,
            scraping: ScrapingConfig::default(),
        }
    }
}

fn default_max_crawl_depth() -> u32 {
    5
}
fn default_min_cluster_size() -> u32 {
    10
}

impl DomainConfig {
    /// Compile the allow-list. An invalid pattern is a config error.
    pub fn url_filter(&self) -> Result<UrlFilter> {
        let patterns = self
            .allowed_url_patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{p})")).map_err(|e| {
                    RunbookError::config(format!("invalid allowed_url_pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(UrlFilter { patterns })
    }
}

/// Compiled allow-list of a domain.
#[derive(Debug, Clone)]
pub struct UrlFilter {
    patterns: Vec<Regex>,
}

impl UrlFilter {
    /// Whether a URL may be crawled or linked.
    pub fn allows(&self, url: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(url))
    }
}

/// How the scraper cuts a page into sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// CSS selectors tried coarsest first.
    #[serde(default = "default_splitting_selectors")]
    pub splitting_selectors: Vec<String>,
    /// Sections longer than this are split with the next selector.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_title_selector")]
    pub title_selector: String,
    /// Selector for the element whose `id` names a section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id_selector: Option<String>,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            splitting_selectors: default_splitting_selectors(),
            max_chunk_size: default_max_chunk_size(),
            title_selector: default_title_selector(),
            section_id_selector: None,
        }
    }
}

fn default_splitting_selectors() -> Vec<String> {
    vec!["html".into(), "article".into(), "section".into()]
}
fn default_max_chunk_size() -> usize {
    50_000
}
fn default_title_selector() -> String {
    "title, h1, h2, h3".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.runbook/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RunbookError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.runbook/runbook.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RunbookError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RunbookError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RunbookError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| RunbookError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RunbookError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RunbookError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read an API key from the env var named in config.
pub fn api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RunbookError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that every API key the pipeline needs is present.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    api_key(&config.llm.api_key_env)?;
    api_key(&config.embedding.api_key_env)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(toml_str.contains("OPENROUTER_API_KEY"));

        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.scraper.retry_limit, 3);
        assert_eq!(parsed.embedding.dimensionality, 768);
        assert_eq!(parsed.engine.max_attempts, 4);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[storage]
path = "/tmp/runbook.db"

[llm]
model = "anthropic/claude-sonnet"
"#,
        )
        .expect("parse");
        assert_eq!(config.storage.path, "/tmp/runbook.db");
        assert_eq!(config.llm.model, "anthropic/claude-sonnet");
        assert_eq!(config.llm.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn domain_config_defaults_from_empty_json() {
        let config: DomainConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, DomainConfig::default());
        assert_eq!(config.max_crawl_depth, 5);
        assert_eq!(config.min_cluster_size, 10);
        assert_eq!(config.scraping.max_chunk_size, 50_000);
        assert_eq!(config.scraping.splitting_selectors, ["html", "article", "section"]);
    }

    #[test]
    fn url_filter_is_anchored() {
        let config = DomainConfig {
            allowed_url_patterns: vec![r"https://docs\.example\.com/".into()],
            ..DomainConfig::default()
        };
        let filter = config.url_filter().expect("compile");
        assert!(filter.allows("https://docs.example.com/guide"));
        assert!(!filter.allows("https://evil.com/?https://docs.example.com/"));
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let filter = DomainConfig::default().url_filter().expect("compile");
        assert!(filter.allows("https://anything.example.org/x"));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let config = DomainConfig {
            allowed_url_patterns: vec!["(unclosed".into()],
            ..DomainConfig::default()
        };
        let err = config.url_filter().unwrap_err();
        assert!(matches!(err, RunbookError::Config { .. }));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/var/db").unwrap(), PathBuf::from("/var/db"));
    }

    #[test]
    fn missing_api_key_is_reported() {
        let result = api_key("RUNBOOK_TEST_NONEXISTENT_KEY_12345");
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
