//! Cluster-domain workflow and the built-in cluster detectors.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, instrument};

use runbook_shared::{
    ClusterDetector, ClusterNode, DomainConfig, Result, RunbookError, TopLevelCluster,
    TopicSummary,
};
use runbook_storage::Storage;

use crate::Collaborators;
use crate::engine::StepContext;
use crate::summarizer::ClusterSummarizer;

/// Detect clusters for a domain and summarize every top-level cluster.
///
/// Returns `(cluster_id, summary)` for the clusters that produced one.
#[instrument(skip(storage, collaborators, ctx))]
pub async fn cluster_domain(
    domain_id: &str,
    storage: &Storage,
    collaborators: &Collaborators,
    ctx: &StepContext<'_>,
) -> Result<Vec<(String, TopicSummary)>> {
    let domain = storage
        .get_domain(domain_id)
        .await?
        .ok_or_else(|| RunbookError::config(format!("domain {domain_id} not found")))?;
    let min_cluster_size = domain
        .config
        .as_ref()
        .map_or_else(|| DomainConfig::default().min_cluster_size, |c| c.min_cluster_size);

    let detected: Option<Vec<ClusterNode>> = ctx
        .run("detect-clusters", collaborators.detector.detect(domain_id))
        .await?;
    if let Some(nodes) = detected {
        ctx.run("store-clusters", async {
            storage.replace_clusters(domain_id, &nodes).await?;
            Ok::<_, RunbookError>(nodes.len())
        })
        .await?;
    }

    let top_level: Vec<TopLevelCluster> = ctx
        .run("top-level-clusters", storage.top_level_clusters(domain_id))
        .await?;

    let summarizer = ClusterSummarizer::new(storage, collaborators.llm.as_ref());
    let mut summaries = Vec::new();
    for cluster in top_level {
        let step = format!("summarize-{}-{}", cluster.cluster_id, cluster.iteration);
        let summary: Option<TopicSummary> = ctx
            .run(
                &step,
                summarizer.generate_summary(
                    domain_id,
                    &cluster.cluster_id,
                    cluster.iteration,
                    min_cluster_size,
                ),
            )
            .await?;
        if let Some(summary) = summary {
            summaries.push((cluster.cluster_id, summary));
        }
    }

    info!(summarized = summaries.len(), "domain clustered");
    Ok(summaries)
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Keeps whatever hierarchy is already stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredClusters;

#[async_trait]
impl ClusterDetector for StoredClusters {
    async fn detect(&self, _domain_id: &str) -> Result<Option<Vec<ClusterNode>>> {
        Ok(None)
    }
}

/// Reads a hierarchy computed elsewhere from a JSON array of
/// [`ClusterNode`]s.
#[derive(Debug, Clone)]
pub struct JsonFileDetector {
    path: PathBuf,
}

impl JsonFileDetector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ClusterDetector for JsonFileDetector {
    async fn detect(&self, _domain_id: &str) -> Result<Option<Vec<ClusterNode>>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RunbookError::io(&self.path, e))?;
        let nodes: Vec<ClusterNode> = serde_json::from_str(&raw).map_err(|e| {
            RunbookError::validation(format!("invalid cluster file {}: {e}", self.path.display()))
        })?;
        Ok(Some(nodes))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use runbook_shared::{CrawlRequest, DomainConfig};
    use runbook_storage::ScrapeRecord;
    use uuid::Uuid;

    use super::*;
    use crate::engine::Journal;
    use crate::testing::{self, Fakes, RecordingSink};

    async fn members(storage: &Storage, prefix: &str, count: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..count {
            let request =
                CrawlRequest::new(format!("https://docs.example.com/{prefix}{i}"), 0, "docs")
                    .unwrap();
            let artifact = storage.reserve_artifact(&request).await.unwrap().unwrap();
            storage
                .mark_scraped(
                    &artifact.artifact_id,
                    &ScrapeRecord {
                        content_hash: &format!("{prefix}{i}"),
                        parsed_text: "text",
                        title: "Page",
                        summary: "summary",
                        metadata: &serde_json::json!({}),
                    },
                )
                .await
                .unwrap();
            ids.push(artifact.artifact_id);
        }
        ids
    }

    fn node(id: &str, members: Vec<String>) -> ClusterNode {
        ClusterNode {
            cluster_id: id.into(),
            iteration: 1,
            members,
            prior_clusters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn detected_clusters_are_stored_and_summarized() {
        let storage = testing::test_storage(DomainConfig {
            min_cluster_size: 3,
            ..DomainConfig::default()
        })
        .await;
        let big = members(&storage, "big", 4).await;
        let small = members(&storage, "small", 2).await;
        let fakes = Fakes::default();
        fakes
            .detector
            .set(vec![node("big", big), node("small", small)]);
        let sink = RecordingSink::default();
        let journal = Arc::new(Journal::default());
        let ctx = StepContext::new("job-cluster", journal.clone(), &sink);

        let summaries = cluster_domain("docs", &storage, &fakes.collaborators(), &ctx)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].0, "big");
        assert_eq!(fakes.llm.calls(), 1);
        assert_eq!(storage.top_level_clusters("docs").await.unwrap().len(), 2);

        // A retry of the same job replays every step.
        let ctx = StepContext::new("job-cluster", journal, &sink);
        let again = cluster_domain("docs", &storage, &fakes.collaborators(), &ctx)
            .await
            .unwrap();
        assert_eq!(again, summaries);
        assert_eq!(fakes.llm.calls(), 1);
    }

    #[tokio::test]
    async fn stored_hierarchy_is_reused_without_detection() {
        let storage = testing::test_storage(DomainConfig {
            min_cluster_size: 1,
            ..DomainConfig::default()
        })
        .await;
        let ids = members(&storage, "p", 2).await;
        storage.replace_clusters("docs", &[node("c", ids)]).await.unwrap();
        let fakes = Fakes::default();
        let sink = RecordingSink::default();
        let ctx = StepContext::new("job-cluster", Arc::new(Journal::default()), &sink);

        let summaries = cluster_domain("docs", &storage, &fakes.collaborators(), &ctx)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(storage.get_cluster_summary("docs", "c", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_domain_is_a_config_error() {
        let storage = testing::test_storage(DomainConfig::default()).await;
        let fakes = Fakes::default();
        let sink = RecordingSink::default();
        let ctx = StepContext::new("job-cluster", Arc::new(Journal::default()), &sink);

        let err = cluster_domain("nope", &storage, &fakes.collaborators(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Config { .. }));
    }

    #[tokio::test]
    async fn json_file_detector_reads_nodes() {
        let path = std::env::temp_dir().join(format!("runbook_clusters_{}.json", Uuid::now_v7()));
        std::fs::write(
            &path,
            r#"[{"cluster_id":"a","iteration":1,"members":["x"]},
                {"cluster_id":"b","iteration":2,"prior_clusters":["a"]}]"#,
        )
        .unwrap();

        let nodes = JsonFileDetector::new(&path).detect("docs").await.unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].prior_clusters, ["a"]);

        std::fs::write(&path, "not json").unwrap();
        let err = JsonFileDetector::new(&path).detect("docs").await.unwrap_err();
        assert!(matches!(err, RunbookError::Validation { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn stored_clusters_detector_keeps_the_hierarchy() {
        assert!(StoredClusters.detect("docs").await.unwrap().is_none());
    }
}
