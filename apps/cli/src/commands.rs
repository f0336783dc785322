//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use runbook_core::{
    Collaborators, DrainReport, JobOutput, JsonFileDetector, LlmExtractor, LocalEngine,
    NomicEmbedder, OpenRouterClient, StoredClusters,
};
use runbook_crawler::HttpScraper;
use runbook_shared::{
    AppConfig, ClusterDetector, CrawlRequest, DEFAULT_REINGEST_CHUNK_SIZE, DomainConfig, Event,
    EventSink, LlmClient, expand_home, init_config, load_config, validate_api_keys,
};
use runbook_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// runbook: ingest documentation into a searchable knowledge base.
#[derive(Parser)]
#[command(
    name = "runbook",
    version,
    about = "Crawl, extract, embed and cluster documentation for runbook generation.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Register and inspect crawl domains.
    Domain {
        #[command(subcommand)]
        action: DomainAction,
    },

    /// Crawl a URL and everything it links to within the domain's limits.
    Crawl {
        /// Start URL.
        url: String,

        /// Domain the URL belongs to.
        #[arg(long)]
        domain: String,

        /// Depth of the start URL.
        #[arg(long, default_value_t = 0)]
        depth: u32,
    },

    /// Re-submit every unfinished artifact of a domain.
    Resume {
        #[arg(long)]
        domain: String,
    },

    /// Summarize the domain's topic clusters.
    Cluster {
        #[arg(long)]
        domain: String,

        /// JSON file with a new cluster hierarchy to import first.
        #[arg(long)]
        import: Option<PathBuf>,
    },

    /// Copy a domain's scraped pages into a second domain and re-chunk and
    /// re-embed them there.
    Reingest {
        #[arg(long)]
        domain: String,

        /// Domain receiving the chunked copies (default: `<domain>-naive`).
        #[arg(long)]
        into: Option<String>,

        /// Maximum chunk size in characters.
        #[arg(long, default_value_t = DEFAULT_REINGEST_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Split a Markdown file into chunks and print them.
    Chunk {
        /// File to split.
        file: PathBuf,

        /// Maximum chunk size in characters.
        #[arg(long, default_value_t = DEFAULT_REINGEST_CHUNK_SIZE)]
        max_size: usize,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Domain subcommands.
#[derive(Subcommand)]
pub(crate) enum DomainAction {
    /// Create or update a domain and its crawl settings.
    Add {
        /// Domain id.
        id: String,

        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,

        /// URL prefix regex a crawled page must match. Repeatable.
        #[arg(long = "allow")]
        allow: Vec<String>,

        #[arg(long, default_value_t = 5)]
        max_depth: u32,

        #[arg(long, default_value_t = 10)]
        min_cluster_size: u32,

        /// Register the domain with crawling switched off.
        #[arg(long)]
        disabled: bool,
    },
    /// Show a domain's settings and artifact counts.
    Show {
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "runbook=info",
        1 => "runbook=debug",
        _ => "runbook=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
        Command::Domain { action } => match action {
            DomainAction::Add {
                id,
                name,
                allow,
                max_depth,
                min_cluster_size,
                disabled,
            } => {
                let config = DomainConfig {
                    allowed_url_patterns: allow,
                    max_crawl_depth: max_depth,
                    min_cluster_size,
                    crawler_disabled: disabled,
                    ..DomainConfig::default()
                };
                cmd_domain_add(&id, name.as_deref(), config).await
            }
            DomainAction::Show { id } => cmd_domain_show(&id).await,
        },
        Command::Crawl { url, domain, depth } => {
            let request = CrawlRequest::new(url, depth, domain)?;
            run_jobs(Event::CrawlRequested(request), None).await
        }
        Command::Resume { domain } => run_jobs(Event::ResumeCrawl { domain_id: domain }, None).await,
        Command::Cluster { domain, import } => {
            run_jobs(Event::ClusterArtifacts { domain_id: domain }, import).await
        }
        Command::Reingest {
            domain,
            into,
            chunk_size,
        } => {
            let target = into.unwrap_or_else(|| naive_domain_id(&domain));
            ensure_reingest_target(&domain, &target).await?;
            run_jobs(
                Event::ReingestDomain {
                    source_domain_id: domain,
                    target_domain_id: target,
                    chunk_size,
                },
                None,
            )
            .await
        }
        Command::Chunk { file, max_size } => cmd_chunk(&file, max_size),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.storage.path)?;
    let storage = Storage::open(&path)
        .await
        .wrap_err_with(|| format!("cannot open database at {}", path.display()))?;
    Ok(storage)
}

async fn cmd_domain_add(id: &str, name: Option<&str>, domain: DomainConfig) -> Result<()> {
    // Reject bad patterns before they are stored.
    domain.url_filter()?;

    let config = load_config()?;
    let storage = open_storage(&config).await?;
    storage
        .upsert_domain(id, name.unwrap_or(id), Some(&domain))
        .await?;

    info!(domain = id, "domain registered");
    println!("Domain '{id}' saved.");
    Ok(())
}

async fn cmd_domain_show(id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let domain = storage
        .get_domain(id)
        .await?
        .ok_or_else(|| eyre!("domain '{id}' not found"))?;

    println!();
    println!("  Domain: {} ({})", domain.name, domain.domain_id);
    match &domain.config {
        Some(c) => {
            println!("  Max depth:        {}", c.max_crawl_depth);
            println!("  Min cluster size: {}", c.min_cluster_size);
            println!("  Crawler disabled: {}", c.crawler_disabled);
            println!("  Allowed URLs:     {}", c.allowed_url_patterns.join(", "));
        }
        None => println!("  No crawl configuration."),
    }
    for (status, count) in storage.count_by_status(id).await? {
        println!("  {:<16}  {count}", status.as_str());
    }
    println!();
    Ok(())
}

fn naive_domain_id(source: &str) -> String {
    format!("{source}-naive")
}

/// Register the re-ingestion target if it does not exist yet. It inherits the
/// source's settings with crawling switched off.
async fn ensure_reingest_target(source: &str, target: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    if storage.get_domain(target).await?.is_some() {
        return Ok(());
    }
    let source_domain = storage
        .get_domain(source)
        .await?
        .ok_or_else(|| eyre!("domain '{source}' not found"))?;

    let target_config = DomainConfig {
        crawler_disabled: true,
        ..source_domain.config.unwrap_or_default()
    };
    storage
        .upsert_domain(
            target,
            &format!("{} (naive)", source_domain.name),
            Some(&target_config),
        )
        .await?;
    info!(source, target, "registered re-ingestion target");
    Ok(())
}

fn cmd_chunk(file: &Path, max_size: usize) -> Result<()> {
    if max_size == 0 {
        return Err(eyre!("--max-size must be positive"));
    }
    let text = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;

    for (index, chunk) in runbook_markdown::split(&text, max_size).enumerate() {
        println!("--- chunk {index} ({} chars) ---", chunk.chars().count());
        println!("{chunk}");
    }
    Ok(())
}

/// Build the production collaborators from config.
fn collaborators(config: &AppConfig, import: Option<PathBuf>) -> Result<Collaborators> {
    validate_api_keys(config)?;

    let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::from_config(&config.llm)?);
    let detector: Arc<dyn ClusterDetector> = match import {
        Some(path) => Arc::new(JsonFileDetector::new(path)),
        None => Arc::new(StoredClusters),
    };

    Ok(Collaborators {
        scraper: Arc::new(HttpScraper::new(&config.scraper)?),
        extractor: Arc::new(LlmExtractor::new(llm.clone())),
        embedder: Arc::new(NomicEmbedder::from_config(&config.embedding)?),
        llm,
        detector,
    })
}

/// Enqueue `event` on a local engine and drain it, showing progress.
async fn run_jobs(event: Event, import: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let collaborators = collaborators(&config, import)?;
    let storage = open_storage(&config).await?;

    let spinner = spinner();
    let engine = LocalEngine::new(&storage, collaborators, config.engine.clone()).on_job(|event| {
        spinner.set_message(describe(event));
    });

    info!(event = event.name(), key = event.concurrency_key(), "starting");
    engine.enqueue(vec![event]).await?;
    let report = engine.drain().await;
    spinner.finish_and_clear();

    print_report(&report);
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(eyre!("{} job(s) failed", report.failed.len()))
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn describe(event: &Event) -> String {
    match event {
        Event::CrawlRequested(request) => {
            format!("Crawling [depth {}] {}", request.crawl_depth, request.url)
        }
        Event::ResumeCrawl { domain_id } => format!("Resuming {domain_id}"),
        Event::ClusterArtifacts { domain_id } => format!("Summarizing clusters of {domain_id}"),
        Event::ReingestDomain {
            source_domain_id,
            target_domain_id,
            ..
        } => format!("Re-ingesting {source_domain_id} into {target_domain_id}"),
    }
}

fn print_report(report: &DrainReport) {
    let mut scraped = 0;
    let mut skipped = 0;
    println!();
    for (_, output) in &report.completed {
        match output {
            JobOutput::Crawl(runbook_core::CrawlOutcome::Scraped { .. }) => scraped += 1,
            JobOutput::Crawl(runbook_core::CrawlOutcome::Skipped { .. }) => skipped += 1,
            JobOutput::Crawl(_) => {}
            JobOutput::Resume { resubmitted } => {
                println!("  Re-submitted: {resubmitted}");
            }
            JobOutput::Cluster { summaries } => {
                for (cluster_id, summary) in summaries {
                    println!("  [{cluster_id}] {}", summary.main_theme);
                    println!("      {}", summary.key_concepts.join(", "));
                }
            }
            JobOutput::Reingest { contents } => {
                println!("  Content rows written: {contents}");
            }
        }
    }
    println!("  Jobs completed: {}", report.completed.len());
    if scraped + skipped > 0 {
        println!("  Pages scraped:  {scraped}");
        println!("  Skipped:        {skipped}");
    }
    for failed in &report.failed {
        println!(
            "  FAILED {} ({}, {} attempts): {}",
            failed.job_id, failed.event, failed.attempts, failed.error
        );
    }
    println!();
}
