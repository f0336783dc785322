//! Crawl state machine for a single URL.
//!
//! One invocation of [`process`] validates the request, reserves the URL,
//! fetches and extracts the page, deduplicates it by content hash, refreshes
//! its link graph and schedules the linked pages one level deeper. Every
//! side effect is either an idempotent upsert or a memoized step, so the job
//! can be delivered more than once.

use std::collections::{BTreeSet, HashMap};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use runbook_markdown::split;
use runbook_shared::{
    Artifact, ArtifactContent, ArtifactLink, CrawlRequest, CrawlStatus, DomainConfig, Event,
    Extraction, NewArtifactContent, Result, RunbookError, ScrapedPage, ScrapedSection, UrlFilter,
};
use runbook_storage::{ScrapeRecord, Storage};

use crate::Collaborators;
use crate::engine::StepContext;
use crate::extraction::{page_request, section_request};

/// Links kept per section; the rest of a link farm is ignored.
pub const MAX_LINKS_PER_SECTION: usize = 50;

/// Why a request was dropped without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotAllowed,
    MaxDepth,
    CrawlerDisabled,
}

/// Terminal result of one crawl job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CrawlOutcome {
    Skipped { reason: SkipReason },
    /// Already scraped at this depth or better.
    Unchanged { artifact_id: String },
    /// Already scraped, now reached by a shorter path.
    Reexpanded { artifact_id: String, scheduled: usize },
    Duplicate {
        artifact_id: String,
        canonical_id: String,
        scheduled: usize,
    },
    Scraped {
        artifact_id: String,
        sections: usize,
        scheduled: usize,
    },
}

/// Process one crawl request.
#[instrument(skip_all, fields(url = %request.url, depth = request.crawl_depth, job = %ctx.job_id()))]
pub async fn process(
    request: &CrawlRequest,
    storage: &Storage,
    collaborators: &Collaborators,
    ctx: &StepContext<'_>,
) -> Result<CrawlOutcome> {
    request.validate()?;

    let domain = storage
        .get_domain(&request.domain_id)
        .await?
        .ok_or_else(|| RunbookError::config(format!("domain {} not found", request.domain_id)))?;
    let config = domain.crawl_config()?;
    let filter = config.url_filter()?;

    if config.crawler_disabled {
        return Ok(skipped(SkipReason::CrawlerDisabled));
    }
    if !filter.allows(&request.url) {
        return Ok(skipped(SkipReason::NotAllowed));
    }
    if request.crawl_depth > config.max_crawl_depth {
        return Ok(skipped(SkipReason::MaxDepth));
    }

    if let Some(existing) = storage
        .get_artifact_by_url(&request.domain_id, &request.url)
        .await?
    {
        if existing.crawl_status == CrawlStatus::Scraped {
            return revisit(request, &existing, config, storage, ctx).await;
        }
    }

    let Some(artifact) = storage.reserve_artifact(request).await? else {
        // Scraped between the lookup and the reservation.
        let existing = storage
            .get_artifact_by_url(&request.domain_id, &request.url)
            .await?
            .ok_or_else(|| {
                RunbookError::Storage(format!("artifact for {} vanished", request.url))
            })?;
        return revisit(request, &existing, config, storage, ctx).await;
    };

    // An earlier, unfinished attempt may have reserved the URL at a shallower
    // depth. The artifact is scraped and expanded at the depth it keeps.
    let reserved;
    let request = if artifact.crawl_depth < request.crawl_depth {
        debug!(reserved = artifact.crawl_depth, "continuing at the reserved depth");
        reserved = CrawlRequest {
            crawl_depth: artifact.crawl_depth,
            ..request.clone()
        };
        &reserved
    } else {
        request
    };

    match scrape(request, &artifact, config, &filter, storage, collaborators, ctx).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if let Err(mark_err) = storage.mark_failed(&artifact.artifact_id).await {
                warn!(error = %mark_err, "could not mark artifact as failed");
            }
            Err(RunbookError::scrape(&request.url, e))
        }
    }
}

fn skipped(reason: SkipReason) -> CrawlOutcome {
    debug!(?reason, "request skipped");
    CrawlOutcome::Skipped { reason }
}

/// Handle a request for an artifact that is already scraped.
async fn revisit(
    request: &CrawlRequest,
    existing: &Artifact,
    config: &DomainConfig,
    storage: &Storage,
    ctx: &StepContext<'_>,
) -> Result<CrawlOutcome> {
    if existing.crawl_depth <= request.crawl_depth {
        return Ok(CrawlOutcome::Unchanged {
            artifact_id: existing.artifact_id.clone(),
        });
    }

    info!(from = existing.crawl_depth, "shorter path found, re-expanding links");
    storage
        .improve_depth(&existing.artifact_id, request.crawl_depth)
        .await?;
    let targets = storage.outbound_targets(existing.canonical_id()).await?;
    let scheduled =
        schedule_children(request, targets, config, storage, ctx, "reexpand-links").await?;

    Ok(CrawlOutcome::Reexpanded {
        artifact_id: existing.artifact_id.clone(),
        scheduled,
    })
}

/// Fetch, extract and persist a reserved artifact.
async fn scrape(
    request: &CrawlRequest,
    artifact: &Artifact,
    config: &DomainConfig,
    filter: &UrlFilter,
    storage: &Storage,
    collaborators: &Collaborators,
    ctx: &StepContext<'_>,
) -> Result<CrawlOutcome> {
    let page: ScrapedPage = ctx
        .run(
            "fetch",
            collaborators
                .scraper
                .fetch_and_parse(&request.url, &config.scraping),
        )
        .await?;
    let content_hash = content_hash(&page.full_text);

    if let Some(canonical) = storage
        .find_by_content_hash(&request.domain_id, &content_hash, &artifact.artifact_id)
        .await?
    {
        info!(canonical = %canonical.artifact_id, "content already crawled");
        // Sections an earlier attempt stored belong to the canonical now.
        storage.prune_contents(&artifact.artifact_id, &[]).await?;
        storage
            .mark_duplicate(&artifact.artifact_id, &canonical)
            .await?;

        // The canonical's links were scheduled from a deeper level.
        let scheduled = if canonical.crawl_depth > request.crawl_depth {
            let targets = storage.outbound_targets(&canonical.artifact_id).await?;
            schedule_children(request, targets, config, storage, ctx, "reexpand-links").await?
        } else {
            0
        };
        return Ok(CrawlOutcome::Duplicate {
            artifact_id: artifact.artifact_id.clone(),
            canonical_id: canonical.artifact_id,
            scheduled,
        });
    }

    let page_extraction: Extraction = ctx
        .run("extract-page", collaborators.extractor.extract(page_request(&page)))
        .await?;

    let sections = if page.sections.is_empty() {
        chunk_sections(&page.full_text, config.scraping.max_chunk_size)
    } else {
        page.sections.clone()
    };

    let section_extractions: Vec<Extraction> = ctx
        .run(
            "extract-sections",
            try_join_all(sections.iter().map(|section| {
                collaborators
                    .extractor
                    .extract(section_request(section, &page_extraction.summary))
            })),
        )
        .await?;

    let texts: Vec<String> = sections
        .iter()
        .zip(&section_extractions)
        .map(|(section, extraction)| format!("{}\n\n{}", section.title, extraction.summary))
        .collect();
    let embeddings: Vec<Vec<f32>> = ctx
        .run("embed-sections", async {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            collaborators.embedder.embed(&texts).await
        })
        .await?;
    if embeddings.len() != sections.len() {
        return Err(RunbookError::Embedding(format!(
            "expected {} vectors, got {}",
            sections.len(),
            embeddings.len()
        )));
    }

    let new_contents: Vec<NewArtifactContent> = sections
        .iter()
        .zip(section_extractions)
        .zip(embeddings)
        .map(|((section, extraction), embedding)| NewArtifactContent {
            artifact_id: artifact.artifact_id.clone(),
            anchor_id: section.anchor_id.clone(),
            title: section.title.clone(),
            parsed_text: section.content.clone(),
            summary: extraction.summary,
            metadata: extraction.metadata,
            embedding,
        })
        .collect();
    let contents = storage.upsert_contents(&new_contents).await?;
    let anchors: Vec<String> = sections.iter().map(|s| s.anchor_id.clone()).collect();
    let pruned = storage
        .prune_contents(&artifact.artifact_id, &anchors)
        .await?;
    if pruned > 0 {
        debug!(pruned, "dropped sections of an earlier attempt");
    }

    let targets = refresh_links(&sections, &contents, filter, storage).await?;
    let scheduled = schedule_children(
        request,
        targets.into_iter().collect(),
        config,
        storage,
        ctx,
        "schedule-children",
    )
    .await?;

    storage
        .mark_scraped(
            &artifact.artifact_id,
            &ScrapeRecord {
                content_hash: &content_hash,
                parsed_text: &page.full_text,
                title: &page.title,
                summary: &page_extraction.summary,
                metadata: &page_extraction.metadata,
            },
        )
        .await?;

    info!(sections = sections.len(), scheduled, "artifact scraped");
    Ok(CrawlOutcome::Scraped {
        artifact_id: artifact.artifact_id.clone(),
        sections: sections.len(),
        scheduled,
    })
}

/// Replace the stored outbound links of every scraped section. Returns the
/// distinct targets that were stored.
async fn refresh_links(
    sections: &[ScrapedSection],
    contents: &[ArtifactContent],
    filter: &UrlFilter,
    storage: &Storage,
) -> Result<BTreeSet<String>> {
    // Matching on text as well as anchor keeps a reordered retry from
    // attaching links to the wrong row.
    let by_key: HashMap<(&str, &str), &ArtifactContent> = contents
        .iter()
        .map(|c| ((c.anchor_id.as_str(), c.parsed_text.as_str()), c))
        .collect();

    let mut matched = Vec::new();
    let mut links = Vec::new();
    let mut targets = BTreeSet::new();
    for section in sections {
        let Some(content) = by_key.get(&(section.anchor_id.as_str(), section.content.as_str()))
        else {
            warn!(anchor = %section.anchor_id, "no stored content for section");
            continue;
        };
        matched.push(content.artifact_content_id.clone());

        for link in section
            .links
            .iter()
            .take(MAX_LINKS_PER_SECTION)
            .filter(|link| filter.allows(&link.url))
        {
            links.push(ArtifactLink {
                source_artifact_content_id: content.artifact_content_id.clone(),
                target_url: link.url.clone(),
                anchor_text: Some(link.anchor_text.clone()),
            });
            targets.insert(link.url.clone());
        }
    }

    let removed = storage.delete_links_for_contents(&matched).await?;
    storage.insert_links(&links).await?;
    debug!(removed, inserted = links.len(), "links refreshed");
    Ok(targets)
}

/// Emit crawl requests one level below `request` for targets not already
/// known at that depth or better.
async fn schedule_children(
    request: &CrawlRequest,
    targets: Vec<String>,
    config: &DomainConfig,
    storage: &Storage,
    ctx: &StepContext<'_>,
    step: &str,
) -> Result<usize> {
    let Some(child_depth) = request.crawl_depth.checked_add(1) else {
        return Ok(0);
    };
    if child_depth > config.max_crawl_depth || targets.is_empty() {
        return Ok(0);
    }

    let known = storage.known_depths(&request.domain_id, &targets).await?;
    let events: Vec<Event> = targets
        .into_iter()
        .filter(|url| known.get(url).is_none_or(|depth| *depth > child_depth))
        .map(|url| Event::CrawlRequested(request.child(url)))
        .collect();
    if events.is_empty() {
        return Ok(0);
    }

    Ok(ctx.send_events(step, events).await?.len())
}

/// Uniform chunks for pages without structural sections.
fn chunk_sections(full_text: &str, max_chunk_size: usize) -> Vec<ScrapedSection> {
    split(full_text, max_chunk_size)
        .enumerate()
        .map(|(index, chunk)| ScrapedSection {
            anchor_id: index.to_string(),
            title: crate::chunk_title(&chunk),
            content: chunk,
            links: Vec::new(),
        })
        .collect()
}

/// Hex SHA-256 of the page text.
pub(crate) fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
