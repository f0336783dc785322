//! Resume sweep: re-submit every unfinished artifact of a domain.

use tracing::{info, instrument};

use runbook_shared::{CrawlRequest, Event, Result, RunbookError};
use runbook_storage::Storage;

use crate::engine::StepContext;

/// Artifacts re-submitted per scheduling step.
pub const RESUME_BATCH_SIZE: usize = 100;

/// Schedule a crawl request for every artifact of `domain_id` that is
/// discovered, scraping or scrape_failed. Returns the number re-submitted.
#[instrument(skip(storage, ctx))]
pub async fn resume_crawl(
    domain_id: &str,
    storage: &Storage,
    ctx: &StepContext<'_>,
) -> Result<usize> {
    if storage.get_domain(domain_id).await?.is_none() {
        return Err(RunbookError::config(format!("domain {domain_id} not found")));
    }

    let mut after: Option<String> = None;
    let mut batch = 0;
    let mut resubmitted = 0;
    loop {
        let page = storage
            .list_unfinished(domain_id, after.as_deref(), RESUME_BATCH_SIZE)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.artifact_id.clone());

        let events = page
            .iter()
            .map(|artifact| {
                CrawlRequest::new(
                    artifact.url.as_str(),
                    artifact.crawl_depth,
                    artifact.domain_id.as_str(),
                )
                .map(Event::CrawlRequested)
            })
            .collect::<Result<Vec<_>>>()?;
        resubmitted += ctx
            .send_events(&format!("resume-batch-{batch}"), events)
            .await?
            .len();
        batch += 1;

        if page.len() < RESUME_BATCH_SIZE {
            break;
        }
    }

    info!(resubmitted, "unfinished artifacts re-submitted");
    Ok(resubmitted)
}
