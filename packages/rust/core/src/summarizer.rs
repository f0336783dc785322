//! Bottom-up topic summaries over the cluster hierarchy.
//!
//! A summary is computed at most once per `(domain_id, cluster_id,
//! iteration)` key and then served from storage. Large merged clusters are
//! summarized from the summaries of the clusters they were merged from, so
//! the model input stays bounded whatever the cluster size.

use futures::FutureExt;
use futures::future::{LocalBoxFuture, try_join_all};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use runbook_shared::{LlmClient, Result, RunbookError, SampledArtifact, TopicSummary};
use runbook_storage::Storage;

/// Clusters at least this large are summarized from their priors.
pub const LARGE_CLUSTER_SIZE: u32 = 100;

const SYSTEM_PROMPT: &str = "You synthesize topic summaries for a documentation knowledge base.";

fn topic_summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "main_theme": {
                "type": "string",
                "description": "A phrase that describes the main theme of the topic."
            },
            "key_concepts": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Phrases that describe key concepts in the topic."
            }
        },
        "required": ["main_theme", "key_concepts"],
        "additionalProperties": false
    })
}

pub struct ClusterSummarizer<'a> {
    storage: &'a Storage,
    llm: &'a dyn LlmClient,
}

impl<'a> ClusterSummarizer<'a> {
    pub fn new(storage: &'a Storage, llm: &'a dyn LlmClient) -> Self {
        Self { storage, llm }
    }

    /// Topic summary of one cluster, or `None` when the cluster is smaller
    /// than `min_cluster_size` or has nothing to summarize.
    #[instrument(skip(self))]
    pub async fn generate_summary(
        &self,
        domain_id: &str,
        cluster_id: &str,
        iteration: u32,
        min_cluster_size: u32,
    ) -> Result<Option<TopicSummary>> {
        self.summarize(
            domain_id.to_string(),
            cluster_id.to_string(),
            iteration,
            min_cluster_size,
        )
        .await
    }

    fn summarize(
        &self,
        domain_id: String,
        cluster_id: String,
        iteration: u32,
        min_cluster_size: u32,
    ) -> LocalBoxFuture<'_, Result<Option<TopicSummary>>> {
        async move {
            if let Some(stored) = self
                .storage
                .get_cluster_summary(&domain_id, &cluster_id, iteration)
                .await?
            {
                debug!("summary cached");
                return Ok(Some(stored));
            }

            let info = self
                .storage
                .cluster_summarization_data(&domain_id, &cluster_id, iteration)
                .await?
                .ok_or_else(|| {
                    RunbookError::validation(format!(
                        "cluster {cluster_id} (iteration {iteration}) not found in domain {domain_id}"
                    ))
                })?;

            if info.member_count < min_cluster_size {
                debug!(members = info.member_count, "cluster below minimum size");
                return Ok(None);
            }

            let summary = if info.member_count < LARGE_CLUSTER_SIZE || iteration <= 2 {
                self.synthesize(&member_lines(&info.sample_artifacts)).await?
            } else {
                // Priors always sit one iteration lower, so the recursion ends.
                let priors = try_join_all(
                    info.prior_clusters
                        .iter()
                        .filter(|prior| prior.iteration < iteration)
                        .map(|prior| {
                            self.summarize(
                                domain_id.clone(),
                                prior.cluster_id.clone(),
                                prior.iteration,
                                min_cluster_size,
                            )
                        }),
                )
                .await?;
                let summaries: Vec<TopicSummary> = priors.into_iter().flatten().collect();
                self.synthesize(&summary_lines(&summaries)).await?
            };

            if let Some(summary) = &summary {
                self.storage
                    .upsert_cluster_summary(
                        &domain_id,
                        &cluster_id,
                        iteration,
                        info.member_count,
                        summary,
                    )
                    .await?;
                info!(theme = %summary.main_theme, "cluster summarized");
            }
            Ok(summary)
        }
        .boxed_local()
    }

    async fn synthesize(&self, lines: &[String]) -> Result<Option<TopicSummary>> {
        if lines.is_empty() {
            return Ok(None);
        }

        let prompt = format!(
            "You are summarizing the main themes and key concepts from a list.\n\
             The list can be a list of summaries of articles, or a list of main themes and key \
             concepts of a group of articles.\n\
             Your goal is to synthesize the main themes and key concepts that cover that list.\n\n\
             Articles or article summaries:\n{}\n\nHigher-level summary:",
            lines.join("\n")
        );

        let value = self
            .llm
            .generate(SYSTEM_PROMPT, &prompt, &topic_summary_schema())
            .await?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RunbookError::Llm(format!("malformed topic summary: {e}")))
    }
}

fn member_lines(members: &[SampledArtifact]) -> Vec<String> {
    members
        .iter()
        .map(|m| format!("- {}: {}", m.title, m.summary))
        .collect()
}

fn summary_lines(summaries: &[TopicSummary]) -> Vec<String> {
    summaries
        .iter()
        .map(|s| {
            format!(
                "- Theme: {}. Key concepts: {}",
                s.main_theme,
                s.key_concepts.join(", ")
            )
        })
        .collect()
}
