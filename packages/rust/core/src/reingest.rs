//! Batch re-ingestion: copy a crawled domain into a second domain, then
//! re-chunk and re-embed the copied page text there.
//!
//! The copy keeps the source domain's structural sections untouched.

use serde_json::json;
use tracing::{debug, info, instrument};

use runbook_markdown::split;
use runbook_shared::{NewArtifactContent, Result, RunbookError};
use runbook_storage::Storage;

use crate::Collaborators;
use crate::engine::StepContext;

/// Artifacts read per storage page.
pub const REINGEST_BATCH_SIZE: usize = 50;

/// Copy the scraped pages of `source_domain_id` into `target_domain_id`,
/// split each copied page into chunks of at most `chunk_size` characters and
/// store one embedded content row per chunk. Rows left over from an earlier
/// run with more chunks are removed. Returns the number of rows written.
#[instrument(skip(storage, collaborators, ctx))]
pub async fn reingest_domain(
    source_domain_id: &str,
    target_domain_id: &str,
    chunk_size: usize,
    storage: &Storage,
    collaborators: &Collaborators,
    ctx: &StepContext<'_>,
) -> Result<usize> {
    if chunk_size == 0 {
        return Err(RunbookError::validation("chunk_size must be positive"));
    }
    if source_domain_id == target_domain_id {
        return Err(RunbookError::validation(
            "re-ingestion needs a target domain other than its source",
        ));
    }
    for domain_id in [source_domain_id, target_domain_id] {
        if storage.get_domain(domain_id).await?.is_none() {
            return Err(RunbookError::config(format!("domain {domain_id} not found")));
        }
    }

    let copied: u64 = ctx
        .run(
            "copy-artifacts",
            storage.copy_domain_artifacts(source_domain_id, target_domain_id),
        )
        .await?;
    info!(copied, "artifacts copied");

    let mut after: Option<String> = None;
    let mut written = 0;
    loop {
        let page = storage
            .list_scraped_with_text(target_domain_id, after.as_deref(), REINGEST_BATCH_SIZE)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.artifact_id.clone());

        for artifact in &page {
            let text = artifact.parsed_text.as_deref().unwrap_or_default();
            let chunks: Vec<String> = split(text, chunk_size).collect();

            let embeddings: Vec<Vec<f32>> = ctx
                .run(&format!("embed-{}", artifact.artifact_id), async {
                    if chunks.is_empty() {
                        return Ok(Vec::new());
                    }
                    collaborators.embedder.embed(&chunks).await
                })
                .await?;
            if embeddings.len() != chunks.len() {
                return Err(RunbookError::Embedding(format!(
                    "expected {} vectors, got {}",
                    chunks.len(),
                    embeddings.len()
                )));
            }

            let contents: Vec<NewArtifactContent> = chunks
                .into_iter()
                .zip(embeddings)
                .enumerate()
                .map(|(index, (chunk, embedding))| NewArtifactContent {
                    artifact_id: artifact.artifact_id.clone(),
                    anchor_id: index.to_string(),
                    title: crate::chunk_title(&chunk),
                    parsed_text: chunk.clone(),
                    summary: chunk,
                    metadata: json!({}),
                    embedding,
                })
                .collect();
            let anchors: Vec<String> = contents.iter().map(|c| c.anchor_id.clone()).collect();
            written += storage.upsert_contents(&contents).await?.len();
            let pruned = storage
                .prune_contents(&artifact.artifact_id, &anchors)
                .await?;
            debug!(
                artifact = %artifact.artifact_id,
                chunks = contents.len(),
                pruned,
                "re-ingested"
            );
        }

        if page.len() < REINGEST_BATCH_SIZE {
            break;
        }
    }

    info!(written, "domain re-ingested");
    Ok(written)
}
