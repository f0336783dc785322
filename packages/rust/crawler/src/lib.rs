//! HTTP scraper for the ingestion pipeline.
//!
//! [`HttpScraper`] implements the [`Scraper`] contract: it fetches a page with
//! bounded retries, converts it to Markdown and cuts it into structural
//! sections with their outbound links.

mod fetch;
mod sections;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{info, instrument};
use url::Url;

use runbook_markdown::html_to_markdown;
use runbook_shared::{
    Result, RunbookError, ScrapedPage, Scraper, ScraperConfig, ScrapingConfig,
};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").expect("valid selector"));

// ---------------------------------------------------------------------------
// HttpScraper
// ---------------------------------------------------------------------------

/// Scraper backed by `reqwest` and `scraper`.
pub struct HttpScraper {
    client: Client,
    retry_limit: u32,
    retry_backoff: Duration,
    allow_private_hosts: bool,
}

impl HttpScraper {
    /// Create a scraper from the `[scraper]` config section.
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Ok(Self {
            client: fetch::build_client(config)?,
            retry_limit: config.retry_limit,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Base delay between attempts; attempt `n` waits `n` times this long.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch_and_parse(&self, url: &str, config: &ScrapingConfig) -> Result<ScrapedPage> {
        let parsed = Url::parse(url)
            .map_err(|e| RunbookError::validation(format!("invalid URL '{url}': {e}")))?;

        if !self.allow_private_hosts && fetch::is_ssrf_target(&parsed) {
            return Err(RunbookError::validation(format!(
                "refusing to fetch private or non-HTTP address {url}"
            )));
        }

        let (final_url, body) =
            fetch::fetch_html(&self.client, &parsed, self.retry_limit, self.retry_backoff).await?;
        let page = parse_page(&final_url, &body, config)?;

        info!(
            sections = page.sections.len(),
            text_len = page.full_text.len(),
            "page scraped"
        );
        Ok(page)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an already fetched HTML document.
pub fn parse_page(url: &Url, html: &str, config: &ScrapingConfig) -> Result<ScrapedPage> {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&TITLE)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let full_text = html_to_markdown(html, Some(url))?;
    let sections = sections::extract_sections(&doc, url, config)?;

    Ok(ScrapedPage {
        url: url.to_string(),
        title,
        full_text,
        sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html>
        <head><title>Deploying</title></head>
        <body>
            <article id="rollout"><h2>Rollout</h2><p>Ship it in waves.</p>
                <a href="/rollback">Rolling back</a></article>
            <article id="monitor"><h2>Monitoring</h2><p>Watch the dashboards.</p></article>
        </body>
    </html>"#;

    fn scraper() -> HttpScraper {
        let config = ScraperConfig {
            allow_private_hosts: true,
            ..ScraperConfig::default()
        };
        HttpScraper::new(&config)
            .unwrap()
            .with_retry_backoff(Duration::ZERO)
    }

    fn article_config() -> ScrapingConfig {
        ScrapingConfig {
            splitting_selectors: vec!["article".into()],
            ..ScrapingConfig::default()
        }
    }

    #[tokio::test]
    async fn fetches_and_sections_a_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/deploy"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let url = format!("{}/deploy", server.uri());
        let page = scraper().fetch_and_parse(&url, &article_config()).await.unwrap();

        assert_eq!(page.title, "Deploying");
        assert!(page.full_text.contains("Ship it in waves."));
        assert_eq!(page.sections.len(), 2);
        assert_eq!(page.sections[0].anchor_id, "rollout");
        assert_eq!(page.sections[0].links.len(), 1);
        assert_eq!(
            page.sections[0].links[0].url,
            format!("{}/rollback", server.uri())
        );
        assert!(page.sections[1].links.is_empty());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/flaky", server.uri());
        let page = scraper().fetch_and_parse(&url, &article_config()).await.unwrap();
        assert_eq!(page.sections.len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/down", server.uri());
        let err = scraper()
            .fetch_and_parse(&url, &article_config())
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Network(_)));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/missing", server.uri());
        let err = scraper()
            .fetch_and_parse(&url, &article_config())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn refuses_private_hosts_by_default() {
        let scraper = HttpScraper::new(&ScraperConfig::default()).unwrap();
        let err = scraper
            .fetch_and_parse("http://127.0.0.1:9/admin", &article_config())
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Validation { .. }));
    }

    #[test]
    fn page_without_title() {
        let url = Url::parse("https://docs.example.com/x").unwrap();
        let page = parse_page(&url, "<html><body><p>Body only</p></body></html>", &ScrapingConfig::default())
            .unwrap();
        assert_eq!(page.title, "");
        assert_eq!(page.sections.len(), 1);
        assert_eq!(page.url, "https://docs.example.com/x");
    }
}
