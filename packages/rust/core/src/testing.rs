//! Fakes for the external collaborators, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use runbook_shared::{
    ClusterDetector, ClusterNode, DomainConfig, Embedder, Event, EventSink, Extraction,
    ExtractionRequest, Extractor, LlmClient, Result, RunbookError, ScrapedLink, ScrapedPage,
    ScrapedSection, Scraper, ScrapingConfig,
};
use runbook_storage::Storage;

use crate::Collaborators;

/// Temp-file storage with a `docs` domain using `config`.
pub(crate) async fn test_storage(config: DomainConfig) -> Storage {
    let tmp = std::env::temp_dir().join(format!("runbook_core_test_{}.db", Uuid::now_v7()));
    let storage = Storage::open(&tmp).await.expect("open test db");
    storage
        .upsert_domain("docs", "Docs", Some(&config))
        .await
        .expect("insert domain");
    storage
}

/// A page whose sections are `(anchor_id, text, links)`.
pub(crate) fn page(url: &str, title: &str, sections: &[(&str, &str, &[&str])]) -> ScrapedPage {
    let sections: Vec<ScrapedSection> = sections
        .iter()
        .map(|(anchor, text, links)| ScrapedSection {
            anchor_id: anchor.to_string(),
            title: format!("{title} / {anchor}"),
            content: text.to_string(),
            links: links
                .iter()
                .map(|url| ScrapedLink {
                    url: url.to_string(),
                    anchor_text: format!("link to {url}"),
                })
                .collect(),
        })
        .collect();
    let body = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    ScrapedPage {
        url: url.to_string(),
        title: title.to_string(),
        full_text: format!("# {title}\n\n{body}"),
        sections,
    }
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeScraper {
    pages: Mutex<HashMap<String, ScrapedPage>>,
    calls: AtomicUsize,
}

impl FakeScraper {
    pub(crate) fn add_page(&self, page: ScrapedPage) {
        self.pages.lock().unwrap().insert(page.url.clone(), page);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn fetch_and_parse(&self, url: &str, _config: &ScrapingConfig) -> Result<ScrapedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RunbookError::Network(format!("{url}: HTTP 503")))
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeExtractor {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl FakeExtractor {
    /// Fail the next `n` calls with a transient error.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RunbookError::Llm("model overloaded".into()));
        }

        let extraction = Extraction {
            summary: format!("summary of {}", request.title),
            metadata: json!({ "title": request.title }),
        };
        self.requests.lock().unwrap().push(request);
        Ok(extraction)
    }
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeEmbedder {
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Returns `{"main_theme": "theme N", ...}` for the N-th call.
#[derive(Default)]
pub(crate) struct FakeLlm {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn generate(&self, _system: &str, prompt: &str, _schema: &Value) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(json!({
            "main_theme": format!("theme {n}"),
            "key_concepts": [format!("concept {n}a"), format!("concept {n}b")],
            "summary": format!("summary {n}"),
        }))
    }
}

// ---------------------------------------------------------------------------
// Detector / sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeDetector {
    nodes: Mutex<Option<Vec<ClusterNode>>>,
}

impl FakeDetector {
    /// Return `nodes` from the next detection run.
    pub(crate) fn set(&self, nodes: Vec<ClusterNode>) {
        *self.nodes.lock().unwrap() = Some(nodes);
    }
}

#[async_trait]
impl ClusterDetector for FakeDetector {
    async fn detect(&self, _domain_id: &str) -> Result<Option<Vec<ClusterNode>>> {
        Ok(self.nodes.lock().unwrap().take())
    }
}

/// Sink that records events instead of running them.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn enqueue(&self, events: Vec<Event>) -> Result<Vec<String>> {
        let mut recorded = self.events.lock().unwrap();
        let start = recorded.len();
        let ids = (start..start + events.len()).map(|i| format!("evt-{i}")).collect();
        recorded.extend(events);
        Ok(ids)
    }
}

/// All fakes, kept as `Arc`s so tests can inspect them after handing out
/// [`Collaborators`].
#[derive(Default, Clone)]
pub(crate) struct Fakes {
    pub(crate) scraper: Arc<FakeScraper>,
    pub(crate) extractor: Arc<FakeExtractor>,
    pub(crate) embedder: Arc<FakeEmbedder>,
    pub(crate) llm: Arc<FakeLlm>,
    pub(crate) detector: Arc<FakeDetector>,
}

impl Fakes {
    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            scraper: self.scraper.clone(),
            extractor: self.extractor.clone(),
            embedder: self.embedder.clone(),
            llm: self.llm.clone(),
            detector: self.detector.clone(),
        }
    }
}
