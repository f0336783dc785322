//! Local step engine.
//!
//! [`StepContext`] gives a job named, memoized steps: a step's JSON result is
//! recorded in the job's [`Journal`] and replayed when the job is retried.
//! [`LocalEngine`] is an in-process FIFO work queue that implements
//! [`EventSink`], dispatches events to their handlers and retries failed jobs.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use runbook_shared::{EngineConfig, Event, EventSink, Result, RunbookError, TopicSummary};
use runbook_storage::Storage;

use crate::Collaborators;
use crate::crawl::{self, CrawlOutcome};
use crate::{cluster, reingest, resume};

// ---------------------------------------------------------------------------
// Journal / StepContext
// ---------------------------------------------------------------------------

/// Completed step results of one job, kept across its retries.
#[derive(Debug, Default)]
pub struct Journal {
    steps: Mutex<HashMap<String, Value>>,
}

impl Journal {
    fn get(&self, step: &str) -> Result<Option<Value>> {
        Ok(self
            .steps
            .lock()
            .map_err(|_| RunbookError::Storage("step journal lock poisoned".into()))?
            .get(step)
            .cloned())
    }

    fn record(&self, step: &str, value: Value) -> Result<()> {
        self.steps
            .lock()
            .map_err(|_| RunbookError::Storage("step journal lock poisoned".into()))?
            .insert(step.to_string(), value);
        Ok(())
    }

    /// Number of recorded steps.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .steps
            .lock()
            .map_err(|_| RunbookError::Storage("step journal lock poisoned".into()))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Per-job handle passed explicitly to every handler.
pub struct StepContext<'a> {
    job_id: String,
    journal: Arc<Journal>,
    sink: &'a dyn EventSink,
}

impl<'a> StepContext<'a> {
    pub fn new(job_id: impl Into<String>, journal: Arc<Journal>, sink: &'a dyn EventSink) -> Self {
        Self {
            job_id: job_id.into(),
            journal,
            sink,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Run `step` once per job. A retry of the job replays the recorded
    /// result instead of polling `step` again.
    pub async fn run<T, F>(&self, name: &str, step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        if let Some(recorded) = self.journal.get(name)? {
            debug!(job = %self.job_id, step = name, "replaying memoized step");
            return serde_json::from_value(recorded).map_err(|e| {
                RunbookError::Storage(format!("step {name} has an unreadable journal entry: {e}"))
            });
        }

        let value = step.await?;
        let recorded = serde_json::to_value(&value)
            .map_err(|e| RunbookError::Storage(format!("step {name} result is not JSON: {e}")))?;
        self.journal.record(name, recorded)?;
        debug!(job = %self.job_id, step = name, "step completed");
        Ok(value)
    }

    /// Schedule follow-up jobs as a memoized step.
    pub async fn send_events(&self, name: &str, events: Vec<Event>) -> Result<Vec<String>> {
        self.run(name, self.sink.enqueue(events)).await
    }
}

// ---------------------------------------------------------------------------
// LocalEngine
// ---------------------------------------------------------------------------

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Crawl(CrawlOutcome),
    Resume { resubmitted: usize },
    Cluster { summaries: Vec<(String, TopicSummary)> },
    Reingest { contents: usize },
}

/// A job that exhausted its attempts or failed fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub job_id: String,
    pub event: &'static str,
    pub attempts: u32,
    pub error: String,
}

/// Result of draining the queue.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: Vec<(String, JobOutput)>,
    pub failed: Vec<FailedJob>,
}

struct QueuedJob {
    id: String,
    event: Event,
}

type JobListener<'a> = Box<dyn Fn(&Event) + Send + Sync + 'a>;

/// In-process work queue executing one job at a time.
pub struct LocalEngine<'a> {
    storage: &'a Storage,
    collaborators: Collaborators,
    config: EngineConfig,
    queue: Mutex<VecDeque<QueuedJob>>,
    next_id: AtomicU64,
    listener: Option<JobListener<'a>>,
}

impl<'a> LocalEngine<'a> {
    pub fn new(storage: &'a Storage, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            storage,
            collaborators,
            config,
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            listener: None,
        }
    }

    /// Call `listener` before each job starts.
    pub fn on_job(mut self, listener: impl Fn(&Event) + Send + Sync + 'a) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> Result<usize> {
        Ok(self
            .queue
            .lock()
            .map_err(|_| RunbookError::Storage("job queue lock poisoned".into()))?
            .len())
    }

    fn push(&self, events: Vec<Event>) -> Result<Vec<String>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| RunbookError::Storage("job queue lock poisoned".into()))?;

        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            event.validate()?;
            let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!(job = %id, event = event.name(), key = event.concurrency_key(), "queued");
            ids.push(id.clone());
            queue.push_back(QueuedJob { id, event });
        }
        Ok(ids)
    }

    fn pop(&self) -> Result<Option<QueuedJob>> {
        Ok(self
            .queue
            .lock()
            .map_err(|_| RunbookError::Storage("job queue lock poisoned".into()))?
            .pop_front())
    }

    /// Run queued jobs, including the ones they schedule, until the queue is
    /// empty.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let job = match self.pop() {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "cannot read the job queue");
                    break;
                }
            };
            if let Some(listener) = &self.listener {
                listener(&job.event);
            }

            let journal = Arc::new(Journal::default());
            let max_attempts = self.config.max_attempts.max(1);
            let mut attempt = 0;

            loop {
                attempt += 1;
                let ctx = StepContext::new(job.id.as_str(), journal.clone(), self);
                match self.dispatch(&job.event, &ctx).await {
                    Ok(output) => {
                        debug!(job = %job.id, attempt, "job completed");
                        report.completed.push((job.id.clone(), output));
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt < max_attempts => {
                        warn!(job = %job.id, event = job.event.name(), attempt, error = %e, "job failed, retrying");
                        let delay = self.config.backoff_ms.saturating_mul(u64::from(attempt));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Err(e) => {
                        error!(job = %job.id, event = job.event.name(), attempt, error = %e, "job failed");
                        report.failed.push(FailedJob {
                            job_id: job.id.clone(),
                            event: job.event.name(),
                            attempts: attempt,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "queue drained"
        );
        report
    }

    async fn dispatch(&self, event: &Event, ctx: &StepContext<'_>) -> Result<JobOutput> {
        let storage = self.storage;
        let collaborators = &self.collaborators;

        match event {
            Event::CrawlRequested(request) => crawl::process(request, storage, collaborators, ctx)
                .await
                .map(JobOutput::Crawl),
            Event::ResumeCrawl { domain_id } => resume::resume_crawl(domain_id, storage, ctx)
                .await
                .map(|resubmitted| JobOutput::Resume { resubmitted }),
            Event::ClusterArtifacts { domain_id } => {
                cluster::cluster_domain(domain_id, storage, collaborators, ctx)
                    .await
                    .map(|summaries| JobOutput::Cluster { summaries })
            }
            Event::ReingestDomain {
                source_domain_id,
                target_domain_id,
                chunk_size,
            } => reingest::reingest_domain(
                source_domain_id,
                target_domain_id,
                *chunk_size,
                storage,
                collaborators,
                ctx,
            )
            .await
            .map(|contents| JobOutput::Reingest { contents }),
        }
    }
}

#[async_trait]
impl EventSink for LocalEngine<'_> {
    async fn enqueue(&self, events: Vec<Event>) -> Result<Vec<String>> {
        self.push(events)
    }
}
