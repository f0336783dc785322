//! libSQL storage layer for the ingestion pipeline.
//!
//! The [`Storage`] struct wraps a local libSQL database holding domains,
//! artifacts with their content sections and link graph, the cluster
//! hierarchy and cached topic summaries.
//!
//! Every crawl mutation is an upsert or a delete-then-insert keyed by stable
//! identifiers, so repeating a step after a crash leaves the same rows behind.

mod migrations;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database, Row, Value, params, params_from_iter};
use tracing::{debug, info};

use runbook_shared::{
    Artifact, ArtifactContent, ArtifactLink, ClusterInfo, ClusterNode, CrawlRequest, CrawlStatus,
    Domain, DomainConfig, NewArtifactContent, PriorCluster, Result, RunbookError,
    SampledArtifact, TopLevelCluster, TopicSummary, new_artifact_id,
};

/// Maximum number of ids bound into a single statement.
pub const BATCH_SIZE: usize = 100;

/// Maximum number of members sampled per cluster.
pub const CLUSTER_SAMPLE_SIZE: u32 = 20;

const ARTIFACT_COLUMNS: &str = "artifact_id, domain_id, url, crawl_status, crawl_depth, \
     content_hash, parsed_text, title, summary, metadata, crawled_as_artifact_id, \
     created_at, updated_at";

const CONTENT_COLUMNS: &str =
    "artifact_content_id, artifact_id, anchor_id, title, parsed_text, summary, metadata, embedding";

/// Page-level fields written when an artifact finishes scraping.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeRecord<'a> {
    pub content_hash: &'a str,
    pub parsed_text: &'a str,
    pub title: &'a str,
    pub summary: &'a str,
    pub metadata: &'a serde_json::Value,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RunbookError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RunbookError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Domains
    // -----------------------------------------------------------------------

    /// Insert or update a domain and its crawl configuration.
    pub async fn upsert_domain(
        &self,
        domain_id: &str,
        name: &str,
        config: Option<&DomainConfig>,
    ) -> Result<()> {
        let config_json = config
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RunbookError::config(format!("cannot encode domain config: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO domains (domain_id, name, config_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(domain_id) DO UPDATE SET
                   name = excluded.name,
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![domain_id, name, config_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a domain by id.
    pub async fn get_domain(&self, domain_id: &str) -> Result<Option<Domain>> {
        let mut rows = self
            .conn
            .query(
                "SELECT domain_id, name, config_json FROM domains WHERE domain_id = ?1",
                params![domain_id],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };

        let config = match opt_text(&row, 2)? {
            Some(json) => Some(serde_json::from_str::<DomainConfig>(&json).map_err(|e| {
                RunbookError::config(format!("domain {domain_id} has an invalid config: {e}"))
            })?),
            None => None,
        };

        Ok(Some(Domain {
            domain_id: row.get::<String>(0).map_err(storage_err)?,
            name: row.get::<String>(1).map_err(storage_err)?,
            config,
        }))
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Look up a domain's artifact by its URL.
    pub async fn get_artifact_by_url(&self, domain_id: &str, url: &str) -> Result<Option<Artifact>> {
        let sql =
            format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE domain_id = ?1 AND url = ?2");
        Ok(self.query_artifacts(&sql, params![domain_id, url]).await?.pop())
    }

    /// Look up an artifact by id.
    pub async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE artifact_id = ?1");
        Ok(self.query_artifacts(&sql, params![artifact_id]).await?.pop())
    }

    /// Reserve a URL for scraping.
    ///
    /// Creates the row in `scraping` state, or moves an unfinished row back to
    /// `scraping` keeping the smaller depth. Returns `None` when the URL is
    /// already scraped, in which case the caller must not fetch it.
    pub async fn reserve_artifact(&self, request: &CrawlRequest) -> Result<Option<Artifact>> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO artifacts (artifact_id, domain_id, url, crawl_status, crawl_depth, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'scraping', ?4, ?5, ?5)
             ON CONFLICT(domain_id, url) DO UPDATE SET
               crawl_status = 'scraping',
               crawl_depth = MIN(artifacts.crawl_depth, excluded.crawl_depth),
               updated_at = excluded.updated_at
             WHERE artifacts.crawl_status <> 'scraped'
             RETURNING {ARTIFACT_COLUMNS}"
        );
        let reserved = self
            .query_artifacts(
                &sql,
                params![
                    new_artifact_id(),
                    request.domain_id.as_str(),
                    request.url.as_str(),
                    request.crawl_depth,
                    now.as_str()
                ],
            )
            .await?
            .pop();

        debug!(url = %request.url, reserved = reserved.is_some(), "reservation");
        Ok(reserved)
    }

    /// Lower an artifact's depth. Larger values are ignored.
    pub async fn improve_depth(&self, artifact_id: &str, depth: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE artifacts SET crawl_depth = MIN(crawl_depth, ?2), updated_at = ?3
                 WHERE artifact_id = ?1",
                params![artifact_id, depth, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record a successful scrape.
    pub async fn mark_scraped(&self, artifact_id: &str, record: &ScrapeRecord<'_>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE artifacts SET
                   crawl_status = 'scraped',
                   content_hash = ?2,
                   parsed_text = ?3,
                   title = ?4,
                   summary = ?5,
                   metadata = ?6,
                   crawled_as_artifact_id = NULL,
                   updated_at = ?7
                 WHERE artifact_id = ?1",
                params![
                    artifact_id,
                    record.content_hash,
                    record.parsed_text,
                    record.title,
                    record.summary,
                    record.metadata.to_string(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark an artifact as a content duplicate of `canonical`, copying its
    /// page-level fields.
    pub async fn mark_duplicate(&self, artifact_id: &str, canonical: &Artifact) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let metadata = canonical.metadata.as_ref().map(|m| m.to_string());
        self.conn
            .execute(
                "UPDATE artifacts SET
                   crawl_status = 'scraped',
                   content_hash = ?2,
                   parsed_text = ?3,
                   title = ?4,
                   summary = ?5,
                   metadata = ?6,
                   crawled_as_artifact_id = ?7,
                   updated_at = ?8
                 WHERE artifact_id = ?1",
                params![
                    artifact_id,
                    canonical.content_hash.clone(),
                    canonical.parsed_text.clone(),
                    canonical.title.clone(),
                    canonical.summary.clone(),
                    metadata,
                    canonical.artifact_id.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record a failed scrape. Scraped rows are left alone.
    pub async fn mark_failed(&self, artifact_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE artifacts SET crawl_status = 'scrape_failed', updated_at = ?2
                 WHERE artifact_id = ?1 AND crawl_status <> 'scraped'",
                params![artifact_id, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// The domain's scraped, non-duplicate artifact carrying `content_hash`,
    /// other than `exclude_artifact_id`.
    pub async fn find_by_content_hash(
        &self,
        domain_id: &str,
        content_hash: &str,
        exclude_artifact_id: &str,
    ) -> Result<Option<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE domain_id = ?1
               AND content_hash = ?2
               AND crawled_as_artifact_id IS NULL
               AND crawl_status = 'scraped'
               AND artifact_id <> ?3
             ORDER BY artifact_id
             LIMIT 1"
        );
        Ok(self
            .query_artifacts(&sql, params![domain_id, content_hash, exclude_artifact_id])
            .await?
            .pop())
    }

    /// One page of a domain's unfinished artifacts, ordered by id, after `after`.
    pub async fn list_unfinished(
        &self,
        domain_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE domain_id = ?1
               AND crawl_status IN ('discovered', 'scraping', 'scrape_failed')
               AND artifact_id > ?2
             ORDER BY artifact_id
             LIMIT ?3"
        );
        self.query_artifacts(&sql, params![domain_id, after.unwrap_or(""), limit as i64])
            .await
    }

    /// One page of a domain's canonical scraped artifacts that have text.
    pub async fn list_scraped_with_text(
        &self,
        domain_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE domain_id = ?1
               AND crawl_status = 'scraped'
               AND crawled_as_artifact_id IS NULL
               AND parsed_text IS NOT NULL
               AND artifact_id > ?2
             ORDER BY artifact_id
             LIMIT ?3"
        );
        self.query_artifacts(&sql, params![domain_id, after.unwrap_or(""), limit as i64])
            .await
    }

    /// Stored depth of every URL among `urls` the domain already knows.
    pub async fn known_depths(
        &self,
        domain_id: &str,
        urls: &[String],
    ) -> Result<HashMap<String, u32>> {
        let mut depths = HashMap::new();
        for batch in urls.chunks(BATCH_SIZE) {
            let sql = format!(
                "SELECT url, crawl_depth FROM artifacts WHERE domain_id = ?1 AND url IN ({})",
                placeholders(batch.len(), 2)
            );
            let params = std::iter::once(domain_id.to_string()).chain(batch.iter().cloned());
            let mut rows = self
                .conn
                .query(&sql, params_from_iter(params))
                .await
                .map_err(storage_err)?;
            while let Some(row) = rows.next().await.map_err(storage_err)? {
                depths.insert(
                    row.get::<String>(0).map_err(storage_err)?,
                    row.get::<u32>(1).map_err(storage_err)?,
                );
            }
        }
        Ok(depths)
    }

    /// Copy the canonical scraped artifacts of `source_domain_id` that have
    /// text into `target_domain_id`, keyed by URL. Rows already copied are
    /// refreshed in place and keep their id. Returns the number of rows
    /// written.
    pub async fn copy_domain_artifacts(
        &self,
        source_domain_id: &str,
        target_domain_id: &str,
    ) -> Result<u64> {
        if source_domain_id == target_domain_id {
            return Err(RunbookError::validation(
                "cannot copy a domain's artifacts onto itself",
            ));
        }

        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE domain_id = ?1
               AND crawl_status = 'scraped'
               AND crawled_as_artifact_id IS NULL
               AND parsed_text IS NOT NULL
             ORDER BY artifact_id"
        );
        let sources = self.query_artifacts(&sql, params![source_domain_id]).await?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let mut copied = 0;
        for artifact in &sources {
            let metadata = artifact.metadata.as_ref().map(|m| m.to_string());
            copied += tx
                .execute(
                    "INSERT INTO artifacts
                       (artifact_id, domain_id, url, crawl_status, crawl_depth, content_hash,
                        parsed_text, title, summary, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'scraped', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     ON CONFLICT(domain_id, url) DO UPDATE SET
                       crawl_status = 'scraped',
                       crawl_depth = excluded.crawl_depth,
                       content_hash = excluded.content_hash,
                       parsed_text = excluded.parsed_text,
                       title = excluded.title,
                       summary = excluded.summary,
                       metadata = excluded.metadata,
                       crawled_as_artifact_id = NULL,
                       updated_at = excluded.updated_at",
                    params![
                        new_artifact_id(),
                        target_domain_id,
                        artifact.url.as_str(),
                        artifact.crawl_depth,
                        artifact.content_hash.clone(),
                        artifact.parsed_text.clone(),
                        artifact.title.clone(),
                        artifact.summary.clone(),
                        metadata,
                        now.as_str()
                    ],
                )
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        info!(source_domain_id, target_domain_id, copied, "copied domain artifacts");
        Ok(copied)
    }

    /// Number of artifacts per crawl status for a domain.
    pub async fn count_by_status(&self, domain_id: &str) -> Result<Vec<(CrawlStatus, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT crawl_status, COUNT(*) FROM artifacts
                 WHERE domain_id = ?1 GROUP BY crawl_status ORDER BY crawl_status",
                params![domain_id],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let status: CrawlStatus = row.get::<String>(0).map_err(storage_err)?.parse()?;
            counts.push((status, row.get::<i64>(1).map_err(storage_err)? as u64));
        }
        Ok(counts)
    }

    async fn query_artifacts(&self, sql: &str, params: impl IntoParams) -> Result<Vec<Artifact>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        let mut artifacts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            artifacts.push(row_to_artifact(&row)?);
        }
        Ok(artifacts)
    }

    // -----------------------------------------------------------------------
    // Artifact contents
    // -----------------------------------------------------------------------

    /// Upsert content sections keyed by `(artifact_id, anchor_id)`.
    ///
    /// Existing rows keep their id, so links pointing at them stay valid.
    pub async fn upsert_contents(
        &self,
        contents: &[NewArtifactContent],
    ) -> Result<Vec<ArtifactContent>> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO artifact_contents
               (artifact_content_id, artifact_id, anchor_id, title, parsed_text, summary, metadata, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(artifact_id, anchor_id) DO UPDATE SET
               title = excluded.title,
               parsed_text = excluded.parsed_text,
               summary = excluded.summary,
               metadata = excluded.metadata,
               embedding = excluded.embedding,
               updated_at = excluded.updated_at
             RETURNING {CONTENT_COLUMNS}"
        );

        let mut stored = Vec::with_capacity(contents.len());
        for content in contents {
            let embedding = serde_json::to_string(&content.embedding)
                .map_err(|e| RunbookError::Storage(format!("cannot encode embedding: {e}")))?;
            let mut rows = self
                .conn
                .query(
                    &sql,
                    params![
                        uuid::Uuid::now_v7().to_string(),
                        content.artifact_id.as_str(),
                        content.anchor_id.as_str(),
                        content.title.as_str(),
                        content.parsed_text.as_str(),
                        content.summary.as_str(),
                        content.metadata.to_string(),
                        embedding,
                        now.as_str()
                    ],
                )
                .await
                .map_err(storage_err)?;
            let row = rows
                .next()
                .await
                .map_err(storage_err)?
                .ok_or_else(|| RunbookError::Storage("content upsert returned no row".into()))?;
            stored.push(row_to_content(&row)?);
        }
        Ok(stored)
    }

    /// All content sections of an artifact in insertion order.
    pub async fn list_contents(&self, artifact_id: &str) -> Result<Vec<ArtifactContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM artifact_contents WHERE artifact_id = ?1 ORDER BY rowid"
        );
        let mut rows = self
            .conn
            .query(&sql, params![artifact_id])
            .await
            .map_err(storage_err)?;

        let mut contents = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            contents.push(row_to_content(&row)?);
        }
        Ok(contents)
    }

    /// Delete an artifact's content sections whose anchor is not in `keep`,
    /// along with their outbound links. Returns the number of sections removed.
    pub async fn prune_contents(&self, artifact_id: &str, keep: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .list_contents(artifact_id)
            .await?
            .into_iter()
            .filter(|content| !keep.contains(content.anchor_id.as_str()))
            .map(|content| content.artifact_content_id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        self.delete_links_for_contents(&stale).await?;
        let mut removed = 0;
        for batch in stale.chunks(BATCH_SIZE) {
            let sql = format!(
                "DELETE FROM artifact_contents WHERE artifact_content_id IN ({})",
                placeholders(batch.len(), 1)
            );
            removed += self
                .conn
                .execute(&sql, params_from_iter(batch.iter().cloned()))
                .await
                .map_err(storage_err)?;
        }
        debug!(artifact_id, removed, "pruned stale content sections");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Delete every outbound link of the given content sections.
    pub async fn delete_links_for_contents(&self, content_ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for batch in content_ids.chunks(BATCH_SIZE) {
            let sql = format!(
                "DELETE FROM artifact_links WHERE source_artifact_content_id IN ({})",
                placeholders(batch.len(), 1)
            );
            deleted += self
                .conn
                .execute(&sql, params_from_iter(batch.iter().cloned()))
                .await
                .map_err(storage_err)?;
        }
        Ok(deleted)
    }

    /// Insert link rows.
    pub async fn insert_links(&self, links: &[ArtifactLink]) -> Result<()> {
        for batch in links.chunks(BATCH_SIZE) {
            let values = (0..batch.len())
                .map(|i| format!("(?{}, ?{}, ?{})", 3 * i + 1, 3 * i + 2, 3 * i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO artifact_links (source_artifact_content_id, target_url, anchor_text) VALUES {values}"
            );
            let params = batch.iter().flat_map(|link| {
                [
                    Value::Text(link.source_artifact_content_id.clone()),
                    Value::Text(link.target_url.clone()),
                    link.anchor_text
                        .clone()
                        .map_or(Value::Null, Value::Text),
                ]
            });
            self.conn
                .execute(&sql, params_from_iter(params))
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Outbound links of one content section.
    pub async fn links_for_content(&self, content_id: &str) -> Result<Vec<ArtifactLink>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_artifact_content_id, target_url, anchor_text
                 FROM artifact_links WHERE source_artifact_content_id = ?1 ORDER BY id",
                params![content_id],
            )
            .await
            .map_err(storage_err)?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            links.push(ArtifactLink {
                source_artifact_content_id: row.get::<String>(0).map_err(storage_err)?,
                target_url: row.get::<String>(1).map_err(storage_err)?,
                anchor_text: opt_text(&row, 2)?,
            });
        }
        Ok(links)
    }

    /// Distinct link targets across all sections of an artifact.
    pub async fn outbound_targets(&self, artifact_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT l.target_url
                 FROM artifact_links l
                 JOIN artifact_contents c ON c.artifact_content_id = l.source_artifact_content_id
                 WHERE c.artifact_id = ?1
                 ORDER BY l.target_url",
                params![artifact_id],
            )
            .await
            .map_err(storage_err)?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            targets.push(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(targets)
    }

    // -----------------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------------

    /// Replace a domain's cluster hierarchy with the result of a new
    /// clustering run. Summaries of the old run are dropped.
    pub async fn replace_clusters(&self, domain_id: &str, nodes: &[ClusterNode]) -> Result<()> {
        validate_hierarchy(nodes)?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for table in [
            "clusters",
            "cluster_members",
            "cluster_lineage",
            "cluster_summaries",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE domain_id = ?1"),
                params![domain_id],
            )
            .await
            .map_err(storage_err)?;
        }

        for node in nodes {
            tx.execute(
                "INSERT INTO clusters (domain_id, cluster_id, iteration, member_count)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    domain_id,
                    node.cluster_id.as_str(),
                    node.iteration,
                    node.members.len() as i64
                ],
            )
            .await
            .map_err(storage_err)?;

            for artifact_id in &node.members {
                tx.execute(
                    "INSERT OR IGNORE INTO cluster_members (domain_id, cluster_id, iteration, artifact_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        domain_id,
                        node.cluster_id.as_str(),
                        node.iteration,
                        artifact_id.as_str()
                    ],
                )
                .await
                .map_err(storage_err)?;
            }

            for prior in &node.prior_clusters {
                tx.execute(
                    "INSERT OR IGNORE INTO cluster_lineage
                       (domain_id, cluster_id, iteration, prior_cluster_id, prior_iteration)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        domain_id,
                        node.cluster_id.as_str(),
                        node.iteration,
                        prior.as_str(),
                        node.iteration - 1
                    ],
                )
                .await
                .map_err(storage_err)?;
            }
        }

        tx.commit().await.map_err(storage_err)?;
        info!(domain_id, clusters = nodes.len(), "replaced cluster hierarchy");
        Ok(())
    }

    /// Clusters that were not merged into any later cluster.
    pub async fn top_level_clusters(&self, domain_id: &str) -> Result<Vec<TopLevelCluster>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.cluster_id, c.iteration FROM clusters c
                 WHERE c.domain_id = ?1
                   AND NOT EXISTS (
                     SELECT 1 FROM cluster_lineage l
                     WHERE l.domain_id = c.domain_id
                       AND l.prior_cluster_id = c.cluster_id
                       AND l.prior_iteration = c.iteration)
                 ORDER BY c.iteration DESC, c.cluster_id",
                params![domain_id],
            )
            .await
            .map_err(storage_err)?;

        let mut clusters = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            clusters.push(TopLevelCluster {
                cluster_id: row.get::<String>(0).map_err(storage_err)?,
                iteration: row.get::<u32>(1).map_err(storage_err)?,
            });
        }
        Ok(clusters)
    }

    /// Member count, member sample and prior clusters of one cluster.
    ///
    /// Prior clusters are listed only for `iteration > 2`. Returns `None` when
    /// the cluster does not exist.
    pub async fn cluster_summarization_data(
        &self,
        domain_id: &str,
        cluster_id: &str,
        iteration: u32,
    ) -> Result<Option<ClusterInfo>> {
        let mut rows = self
            .conn
            .query(
                "SELECT member_count FROM clusters
                 WHERE domain_id = ?1 AND cluster_id = ?2 AND iteration = ?3",
                params![domain_id, cluster_id, iteration],
            )
            .await
            .map_err(storage_err)?;
        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let member_count = row.get::<u32>(0).map_err(storage_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT a.artifact_id, COALESCE(a.title, ''), COALESCE(a.summary, ''), a.url
                 FROM cluster_members m
                 JOIN artifacts a ON a.artifact_id = m.artifact_id
                 WHERE m.domain_id = ?1 AND m.cluster_id = ?2 AND m.iteration = ?3
                   AND a.crawl_status = 'scraped'
                 ORDER BY a.artifact_id
                 LIMIT ?4",
                params![domain_id, cluster_id, iteration, CLUSTER_SAMPLE_SIZE],
            )
            .await
            .map_err(storage_err)?;
        let mut sample_artifacts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            sample_artifacts.push(SampledArtifact {
                artifact_id: row.get::<String>(0).map_err(storage_err)?,
                title: row.get::<String>(1).map_err(storage_err)?,
                summary: row.get::<String>(2).map_err(storage_err)?,
                url: row.get::<String>(3).map_err(storage_err)?,
            });
        }

        let mut prior_clusters = Vec::new();
        if iteration > 2 {
            let mut rows = self
                .conn
                .query(
                    "SELECT l.prior_cluster_id, l.prior_iteration, c.member_count
                     FROM cluster_lineage l
                     JOIN clusters c
                       ON c.domain_id = l.domain_id
                      AND c.cluster_id = l.prior_cluster_id
                      AND c.iteration = l.prior_iteration
                     WHERE l.domain_id = ?1 AND l.cluster_id = ?2 AND l.iteration = ?3
                     ORDER BY l.prior_cluster_id",
                    params![domain_id, cluster_id, iteration],
                )
                .await
                .map_err(storage_err)?;
            while let Some(row) = rows.next().await.map_err(storage_err)? {
                prior_clusters.push(PriorCluster {
                    cluster_id: row.get::<String>(0).map_err(storage_err)?,
                    iteration: row.get::<u32>(1).map_err(storage_err)?,
                    member_count: row.get::<u32>(2).map_err(storage_err)?,
                });
            }
        }

        Ok(Some(ClusterInfo {
            domain_id: domain_id.to_string(),
            cluster_id: cluster_id.to_string(),
            iteration,
            member_count,
            sample_artifacts,
            prior_clusters,
        }))
    }

    /// Stored topic summary for a cluster key.
    pub async fn get_cluster_summary(
        &self,
        domain_id: &str,
        cluster_id: &str,
        iteration: u32,
    ) -> Result<Option<TopicSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT main_theme, key_concepts FROM cluster_summaries
                 WHERE domain_id = ?1 AND cluster_id = ?2 AND iteration = ?3",
                params![domain_id, cluster_id, iteration],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let key_concepts: Vec<String> =
            serde_json::from_str(&row.get::<String>(1).map_err(storage_err)?)
                .map_err(|e| RunbookError::Storage(format!("invalid key_concepts: {e}")))?;

        Ok(Some(TopicSummary {
            main_theme: row.get::<String>(0).map_err(storage_err)?,
            key_concepts,
        }))
    }

    /// Store a topic summary for a cluster key.
    pub async fn upsert_cluster_summary(
        &self,
        domain_id: &str,
        cluster_id: &str,
        iteration: u32,
        member_count: u32,
        summary: &TopicSummary,
    ) -> Result<()> {
        let key_concepts = serde_json::to_string(&summary.key_concepts)
            .map_err(|e| RunbookError::Storage(format!("cannot encode key_concepts: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO cluster_summaries
                   (domain_id, cluster_id, iteration, member_count, main_theme, key_concepts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(domain_id, cluster_id, iteration) DO UPDATE SET
                   member_count = excluded.member_count,
                   main_theme = excluded.main_theme,
                   key_concepts = excluded.key_concepts",
                params![
                    domain_id,
                    cluster_id,
                    iteration,
                    member_count,
                    summary.main_theme.as_str(),
                    key_concepts,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_err(e: impl std::fmt::Display) -> RunbookError {
    RunbookError::Storage(e.to_string())
}

/// `?n, ?n+1, ...` for `count` parameters starting at `first`.
fn placeholders(count: usize, first: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A nullable text column. Any other column type is an error.
fn opt_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(RunbookError::Storage(format!(
            "column {idx}: expected text or NULL, found {other:?}"
        ))),
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RunbookError::Storage(format!("invalid timestamp '{value}': {e}")))
}

fn parse_json(value: &str, column: &str) -> Result<serde_json::Value> {
    serde_json::from_str(value)
        .map_err(|e| RunbookError::Storage(format!("invalid JSON in {column}: {e}")))
}

/// Check that a cluster hierarchy is well formed before writing it.
fn validate_hierarchy(nodes: &[ClusterNode]) -> Result<()> {
    let mut keys = HashSet::new();
    for node in nodes {
        if node.iteration == 0 {
            return Err(RunbookError::validation(format!(
                "cluster {} has iteration 0; iterations start at 1",
                node.cluster_id
            )));
        }
        if !keys.insert((node.cluster_id.as_str(), node.iteration)) {
            return Err(RunbookError::validation(format!(
                "cluster {} appears twice at iteration {}",
                node.cluster_id, node.iteration
            )));
        }
    }

    for node in nodes {
        for prior in &node.prior_clusters {
            if !keys.contains(&(prior.as_str(), node.iteration - 1)) {
                return Err(RunbookError::validation(format!(
                    "cluster {} at iteration {} names unknown prior cluster {prior}",
                    node.cluster_id, node.iteration
                )));
            }
        }
    }
    Ok(())
}

/// Convert a database row to an [`Artifact`].
fn row_to_artifact(row: &Row) -> Result<Artifact> {
    let status: String = row.get(3).map_err(storage_err)?;
    let metadata = match opt_text(row, 9)? {
        Some(json) => Some(parse_json(&json, "artifacts.metadata")?),
        None => None,
    };

    Ok(Artifact {
        artifact_id: row.get::<String>(0).map_err(storage_err)?,
        domain_id: row.get::<String>(1).map_err(storage_err)?,
        url: row.get::<String>(2).map_err(storage_err)?,
        crawl_status: status.parse()?,
        crawl_depth: row.get::<u32>(4).map_err(storage_err)?,
        content_hash: opt_text(row, 5)?,
        parsed_text: opt_text(row, 6)?,
        title: opt_text(row, 7)?,
        summary: opt_text(row, 8)?,
        metadata,
        crawled_as_artifact_id: opt_text(row, 10)?,
        created_at: parse_timestamp(&row.get::<String>(11).map_err(storage_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(12).map_err(storage_err)?)?,
    })
}

/// Convert a database row to an [`ArtifactContent`].
fn row_to_content(row: &Row) -> Result<ArtifactContent> {
    let embedding: Vec<f32> = serde_json::from_str(&row.get::<String>(7).map_err(storage_err)?)
        .map_err(|e| RunbookError::Storage(format!("invalid embedding: {e}")))?;

    Ok(ArtifactContent {
        artifact_content_id: row.get::<String>(0).map_err(storage_err)?,
        artifact_id: row.get::<String>(1).map_err(storage_err)?,
        anchor_id: row.get::<String>(2).map_err(storage_err)?,
        title: row.get::<String>(3).map_err(storage_err)?,
        parsed_text: row.get::<String>(4).map_err(storage_err)?,
        summary: row.get::<String>(5).map_err(storage_err)?,
        metadata: parse_json(&row.get::<String>(6).map_err(storage_err)?, "metadata")?,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("runbook_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        storage
            .upsert_domain("docs", "Docs", Some(&DomainConfig::default()))
            .await
            .expect("insert domain");
        storage
    }

    fn request(url: &str, depth: u32) -> CrawlRequest {
        CrawlRequest::new(url, depth, "docs").unwrap()
    }

    async fn scraped(storage: &Storage, url: &str, depth: u32, hash: &str) -> Artifact {
        let artifact = storage
            .reserve_artifact(&request(url, depth))
            .await
            .unwrap()
            .expect("reserved");
        storage
            .mark_scraped(
                &artifact.artifact_id,
                &ScrapeRecord {
                    content_hash: hash,
                    parsed_text: "text",
                    title: "Title",
                    summary: "Summary",
                    metadata: &json!({"kind": "guide"}),
                },
            )
            .await
            .unwrap();
        storage.get_artifact(&artifact.artifact_id).await.unwrap().unwrap()
    }

    fn content(artifact_id: &str, anchor: &str, text: &str) -> NewArtifactContent {
        NewArtifactContent {
            artifact_id: artifact_id.into(),
            anchor_id: anchor.into(),
            title: format!("Section {anchor}"),
            parsed_text: text.into(),
            summary: "s".into(),
            metadata: json!({}),
            embedding: vec![0.25, 0.5],
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("runbook_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn domain_roundtrip() {
        let storage = test_storage().await;
        let domain = storage.get_domain("docs").await.unwrap().expect("domain");
        assert_eq!(domain.name, "Docs");
        assert_eq!(domain.config, Some(DomainConfig::default()));

        storage.upsert_domain("bare", "Bare", None).await.unwrap();
        let bare = storage.get_domain("bare").await.unwrap().unwrap();
        assert!(bare.config.is_none());
        assert!(storage.get_domain("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reservation_is_refused_once_scraped() {
        let storage = test_storage().await;
        let first = storage
            .reserve_artifact(&request("https://docs.example.com/a", 2))
            .await
            .unwrap()
            .expect("first reservation");
        assert_eq!(first.crawl_status, CrawlStatus::Scraping);

        // An unfinished row can be reserved again, keeping the smaller depth.
        let again = storage
            .reserve_artifact(&request("https://docs.example.com/a", 4))
            .await
            .unwrap()
            .expect("second reservation");
        assert_eq!(again.artifact_id, first.artifact_id);
        assert_eq!(again.crawl_depth, 2);

        scraped(&storage, "https://docs.example.com/b", 1, "h").await;
        let refused = storage
            .reserve_artifact(&request("https://docs.example.com/b", 0))
            .await
            .unwrap();
        assert!(refused.is_none());
        let b = storage
            .get_artifact_by_url("docs", "https://docs.example.com/b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.crawl_depth, 1);
        assert_eq!(b.crawl_status, CrawlStatus::Scraped);
    }

    #[tokio::test]
    async fn depth_never_increases() {
        let storage = test_storage().await;
        let artifact = scraped(&storage, "https://docs.example.com/a", 3, "h").await;

        storage.improve_depth(&artifact.artifact_id, 5).await.unwrap();
        let stored = storage.get_artifact(&artifact.artifact_id).await.unwrap().unwrap();
        assert_eq!(stored.crawl_depth, 3);

        storage.improve_depth(&artifact.artifact_id, 1).await.unwrap();
        let stored = storage.get_artifact(&artifact.artifact_id).await.unwrap().unwrap();
        assert_eq!(stored.crawl_depth, 1);
    }

    #[tokio::test]
    async fn duplicates_copy_canonical_fields() {
        let storage = test_storage().await;
        let canonical = scraped(&storage, "https://docs.example.com/a", 1, "same").await;

        let dup = storage
            .reserve_artifact(&request("https://docs.example.com/a?ref=nav", 2))
            .await
            .unwrap()
            .unwrap();
        let found = storage
            .find_by_content_hash("docs", "same", &dup.artifact_id)
            .await
            .unwrap()
            .expect("canonical");
        assert_eq!(found.artifact_id, canonical.artifact_id);

        storage.mark_duplicate(&dup.artifact_id, &found).await.unwrap();
        let dup = storage.get_artifact(&dup.artifact_id).await.unwrap().unwrap();
        assert_eq!(dup.crawl_status, CrawlStatus::Scraped);
        assert_eq!(dup.canonical_id(), canonical.artifact_id);
        assert_eq!(dup.title, canonical.title);
        assert_eq!(dup.metadata, canonical.metadata);

        // Aliases are never offered as canonical.
        let other = storage
            .find_by_content_hash("docs", "same", &canonical.artifact_id)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn failed_marks_do_not_touch_scraped_rows() {
        let storage = test_storage().await;
        let done = scraped(&storage, "https://docs.example.com/a", 0, "h").await;
        storage.mark_failed(&done.artifact_id).await.unwrap();
        let done = storage.get_artifact(&done.artifact_id).await.unwrap().unwrap();
        assert_eq!(done.crawl_status, CrawlStatus::Scraped);

        let pending = storage
            .reserve_artifact(&request("https://docs.example.com/b", 0))
            .await
            .unwrap()
            .unwrap();
        storage.mark_failed(&pending.artifact_id).await.unwrap();
        let pending = storage.get_artifact(&pending.artifact_id).await.unwrap().unwrap();
        assert_eq!(pending.crawl_status, CrawlStatus::ScrapeFailed);
    }

    #[tokio::test]
    async fn unfinished_listing_pages_by_id() {
        let storage = test_storage().await;
        for i in 0..5 {
            storage
                .reserve_artifact(&request(&format!("https://docs.example.com/{i}"), 1))
                .await
                .unwrap();
        }
        scraped(&storage, "https://docs.example.com/done", 0, "h").await;

        let first = storage.list_unfinished("docs", None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let after = first.last().map(|a| a.artifact_id.as_str());
        let second = storage.list_unfinished("docs", after, 3).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|a| a.crawl_status != CrawlStatus::Scraped));

        let counts = storage.count_by_status("docs").await.unwrap();
        assert!(counts.contains(&(CrawlStatus::Scraping, 5)));
        assert!(counts.contains(&(CrawlStatus::Scraped, 1)));
    }

    #[tokio::test]
    async fn content_upsert_keeps_ids() {
        let storage = test_storage().await;
        let artifact = scraped(&storage, "https://docs.example.com/a", 0, "h").await;

        let first = storage
            .upsert_contents(&[content(&artifact.artifact_id, "intro", "v1")])
            .await
            .unwrap();
        let second = storage
            .upsert_contents(&[content(&artifact.artifact_id, "intro", "v2")])
            .await
            .unwrap();
        assert_eq!(first[0].artifact_content_id, second[0].artifact_content_id);
        assert_eq!(second[0].parsed_text, "v2");
        assert_eq!(second[0].embedding, vec![0.25, 0.5]);

        let all = storage.list_contents(&artifact.artifact_id).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn links_are_replaced_in_batches() {
        let storage = test_storage().await;
        let artifact = scraped(&storage, "https://docs.example.com/a", 0, "h").await;
        let sections = storage
            .upsert_contents(&[
                content(&artifact.artifact_id, "one", "1"),
                content(&artifact.artifact_id, "two", "2"),
            ])
            .await
            .unwrap();
        let source = sections[0].artifact_content_id.clone();

        let links: Vec<ArtifactLink> = (0..150)
            .map(|i| ArtifactLink {
                source_artifact_content_id: source.clone(),
                target_url: format!("https://docs.example.com/p{i}"),
                anchor_text: (i % 2 == 0).then(|| format!("Page {i}")),
            })
            .collect();
        storage.insert_links(&links).await.unwrap();
        assert_eq!(storage.links_for_content(&source).await.unwrap().len(), 150);
        assert_eq!(storage.outbound_targets(&artifact.artifact_id).await.unwrap().len(), 150);

        let ids: Vec<String> = sections.iter().map(|s| s.artifact_content_id.clone()).collect();
        let deleted = storage.delete_links_for_contents(&ids).await.unwrap();
        assert_eq!(deleted, 150);
        assert!(storage.outbound_targets(&artifact.artifact_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_depths_covers_many_urls() {
        let storage = test_storage().await;
        scraped(&storage, "https://docs.example.com/a", 2, "h1").await;
        scraped(&storage, "https://docs.example.com/b", 4, "h2").await;

        let mut urls: Vec<String> = (0..120)
            .map(|i| format!("https://docs.example.com/unknown/{i}"))
            .collect();
        urls.push("https://docs.example.com/a".into());
        urls.push("https://docs.example.com/b".into());

        let depths = storage.known_depths("docs", &urls).await.unwrap();
        assert_eq!(depths.len(), 2);
        assert_eq!(depths["https://docs.example.com/a"], 2);
        assert_eq!(depths["https://docs.example.com/b"], 4);

        storage.upsert_domain("other", "Other", None).await.unwrap();
        assert!(storage.known_depths("other", &urls).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pruning_drops_sections_missing_from_the_fresh_set() {
        let storage = test_storage().await;
        let artifact = scraped(&storage, "https://docs.example.com/a", 0, "h").await;
        let sections = storage
            .upsert_contents(&[
                content(&artifact.artifact_id, "0", "A"),
                content(&artifact.artifact_id, "1", "B"),
                content(&artifact.artifact_id, "2", "C"),
            ])
            .await
            .unwrap();
        storage
            .insert_links(&[ArtifactLink {
                source_artifact_content_id: sections[2].artifact_content_id.clone(),
                target_url: "https://docs.example.com/c".into(),
                anchor_text: None,
            }])
            .await
            .unwrap();

        let removed = storage
            .prune_contents(&artifact.artifact_id, &["0".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let left = storage.list_contents(&artifact.artifact_id).await.unwrap();
        let anchors: Vec<&str> = left.iter().map(|c| c.anchor_id.as_str()).collect();
        assert_eq!(anchors, ["0"]);
        assert!(storage.outbound_targets(&artifact.artifact_id).await.unwrap().is_empty());
        assert_eq!(
            storage.prune_contents(&artifact.artifact_id, &["0".to_string()]).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn copying_a_domain_keeps_the_source_untouched() {
        let storage = test_storage().await;
        let source = scraped(&storage, "https://docs.example.com/a", 1, "h1").await;
        storage
            .upsert_contents(&[content(&source.artifact_id, "intro", "crawled section")])
            .await
            .unwrap();
        let dup = storage
            .reserve_artifact(&request("https://docs.example.com/a?ref=nav", 2))
            .await
            .unwrap()
            .unwrap();
        storage.mark_duplicate(&dup.artifact_id, &source).await.unwrap();
        storage
            .reserve_artifact(&request("https://docs.example.com/pending", 2))
            .await
            .unwrap();
        storage.upsert_domain("docs-naive", "Docs (naive)", None).await.unwrap();

        let copied = storage.copy_domain_artifacts("docs", "docs-naive").await.unwrap();
        assert_eq!(copied, 1);
        let copy = storage
            .get_artifact_by_url("docs-naive", "https://docs.example.com/a")
            .await
            .unwrap()
            .expect("copied artifact");
        assert_ne!(copy.artifact_id, source.artifact_id);
        assert_eq!(copy.crawl_status, CrawlStatus::Scraped);
        assert_eq!(copy.parsed_text, source.parsed_text);
        assert_eq!(copy.metadata, source.metadata);
        assert!(storage.list_contents(&copy.artifact_id).await.unwrap().is_empty());
        assert_eq!(storage.list_contents(&source.artifact_id).await.unwrap().len(), 1);

        // A second copy refreshes the same rows.
        storage.copy_domain_artifacts("docs", "docs-naive").await.unwrap();
        let again = storage
            .get_artifact_by_url("docs-naive", "https://docs.example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.artifact_id, copy.artifact_id);

        let err = storage.copy_domain_artifacts("docs", "docs").await.unwrap_err();
        assert!(matches!(err, RunbookError::Validation { .. }));
    }

    #[tokio::test]
    async fn null_columns_read_as_none() {
        let storage = test_storage().await;
        let pending = storage
            .reserve_artifact(&request("https://docs.example.com/a", 0))
            .await
            .unwrap()
            .unwrap();
        assert!(pending.content_hash.is_none());
        assert!(pending.metadata.is_none());
        assert!(pending.crawled_as_artifact_id.is_none());

        storage
            .conn
            .execute(
                "UPDATE artifacts SET title = X'2A' WHERE artifact_id = ?1",
                params![pending.artifact_id.as_str()],
            )
            .await
            .unwrap();
        let err = storage.get_artifact(&pending.artifact_id).await.unwrap_err();
        assert!(matches!(err, RunbookError::Storage(_)));
    }

    fn node(id: &str, iteration: u32, members: &[&str], priors: &[&str]) -> ClusterNode {
        ClusterNode {
            cluster_id: id.into(),
            iteration,
            members: members.iter().map(|m| m.to_string()).collect(),
            prior_clusters: priors.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn cluster_hierarchy_queries() {
        let storage = test_storage().await;
        let a = scraped(&storage, "https://docs.example.com/a", 0, "h1").await;
        let b = scraped(&storage, "https://docs.example.com/b", 0, "h2").await;
        let pending = storage
            .reserve_artifact(&request("https://docs.example.com/c", 0))
            .await
            .unwrap()
            .unwrap();

        let members = [
            a.artifact_id.as_str(),
            b.artifact_id.as_str(),
            pending.artifact_id.as_str(),
        ];
        storage
            .replace_clusters(
                "docs",
                &[
                    node("b1", 1, &members[..1], &[]),
                    node("b2", 2, &members[..1], &["b1"]),
                    node("d2", 2, &members[1..], &[]),
                    node("c3", 3, &members, &["b2", "d2"]),
                    node("lonely", 1, &members[2..], &[]),
                ],
            )
            .await
            .unwrap();

        let top = storage.top_level_clusters("docs").await.unwrap();
        assert_eq!(
            top,
            vec![
                TopLevelCluster { cluster_id: "c3".into(), iteration: 3 },
                TopLevelCluster { cluster_id: "lonely".into(), iteration: 1 },
            ]
        );

        let c3 = storage
            .cluster_summarization_data("docs", "c3", 3)
            .await
            .unwrap()
            .expect("c3");
        assert_eq!(c3.member_count, 3);
        // Unscraped members are not sampled.
        assert_eq!(c3.sample_artifacts.len(), 2);
        assert_eq!(c3.prior_clusters.len(), 2);
        assert_eq!(c3.prior_clusters[0].cluster_id, "b2");
        assert_eq!(c3.prior_clusters[1].member_count, 2);

        // Priors are only listed above iteration 2.
        let b2 = storage
            .cluster_summarization_data("docs", "b2", 2)
            .await
            .unwrap()
            .unwrap();
        assert!(b2.prior_clusters.is_empty());

        assert!(
            storage
                .cluster_summarization_data("docs", "nope", 1)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn summaries_roundtrip_and_reset_on_replace() {
        let storage = test_storage().await;
        storage
            .replace_clusters("docs", &[node("c1", 1, &["x"], &[])])
            .await
            .unwrap();

        let summary = TopicSummary {
            main_theme: "Deployments".into(),
            key_concepts: vec!["rollbacks".into(), "canaries".into()],
        };
        storage
            .upsert_cluster_summary("docs", "c1", 1, 1, &summary)
            .await
            .unwrap();
        assert_eq!(
            storage.get_cluster_summary("docs", "c1", 1).await.unwrap(),
            Some(summary)
        );
        assert!(storage.get_cluster_summary("docs", "c1", 2).await.unwrap().is_none());

        storage
            .replace_clusters("docs", &[node("c1", 1, &["x"], &[])])
            .await
            .unwrap();
        assert!(storage.get_cluster_summary("docs", "c1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_hierarchy_is_rejected() {
        let storage = test_storage().await;
        let err = storage
            .replace_clusters("docs", &[node("c2", 2, &[], &["ghost"])])
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Validation { .. }));

        let err = storage
            .replace_clusters("docs", &[node("c0", 0, &[], &[])])
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Validation { .. }));
    }
}
