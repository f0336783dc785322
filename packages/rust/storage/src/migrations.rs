//! SQL migration definitions for the runbook database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Crawl schema: domains, artifacts, artifact_contents, artifact_links",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS domains (
    domain_id   TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    config_json TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id            TEXT PRIMARY KEY,
    domain_id              TEXT NOT NULL REFERENCES domains(domain_id),
    url                    TEXT NOT NULL,
    crawl_status           TEXT NOT NULL,
    crawl_depth            INTEGER NOT NULL,
    content_hash           TEXT,
    parsed_text            TEXT,
    title                  TEXT,
    summary                TEXT,
    metadata               TEXT,
    crawled_as_artifact_id TEXT REFERENCES artifacts(artifact_id),
    created_at             TEXT NOT NULL,
    updated_at             TEXT NOT NULL,
    UNIQUE(domain_id, url)
);

CREATE INDEX IF NOT EXISTS idx_artifacts_domain_status ON artifacts(domain_id, crawl_status);
CREATE INDEX IF NOT EXISTS idx_artifacts_content_hash ON artifacts(domain_id, content_hash);

CREATE TABLE IF NOT EXISTS artifact_contents (
    artifact_content_id TEXT PRIMARY KEY,
    artifact_id         TEXT NOT NULL REFERENCES artifacts(artifact_id),
    anchor_id           TEXT NOT NULL,
    title               TEXT NOT NULL,
    parsed_text         TEXT NOT NULL,
    summary             TEXT NOT NULL,
    metadata            TEXT NOT NULL,
    embedding           TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    UNIQUE(artifact_id, anchor_id)
);

CREATE TABLE IF NOT EXISTS artifact_links (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    source_artifact_content_id TEXT NOT NULL REFERENCES artifact_contents(artifact_content_id),
    target_url                 TEXT NOT NULL,
    anchor_text                TEXT
);

CREATE INDEX IF NOT EXISTS idx_artifact_links_source ON artifact_links(source_artifact_content_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Cluster hierarchy and cached topic summaries",
            sql: r#"
CREATE TABLE IF NOT EXISTS clusters (
    domain_id    TEXT NOT NULL,
    cluster_id   TEXT NOT NULL,
    iteration    INTEGER NOT NULL,
    member_count INTEGER NOT NULL,
    PRIMARY KEY (domain_id, cluster_id, iteration)
);

CREATE TABLE IF NOT EXISTS cluster_members (
    domain_id   TEXT NOT NULL,
    cluster_id  TEXT NOT NULL,
    iteration   INTEGER NOT NULL,
    artifact_id TEXT NOT NULL,
    PRIMARY KEY (domain_id, cluster_id, iteration, artifact_id)
);

CREATE TABLE IF NOT EXISTS cluster_lineage (
    domain_id        TEXT NOT NULL,
    cluster_id       TEXT NOT NULL,
    iteration        INTEGER NOT NULL,
    prior_cluster_id TEXT NOT NULL,
    prior_iteration  INTEGER NOT NULL,
    PRIMARY KEY (domain_id, cluster_id, iteration, prior_cluster_id)
);

CREATE INDEX IF NOT EXISTS idx_cluster_lineage_prior
    ON cluster_lineage(domain_id, prior_cluster_id, prior_iteration);

CREATE TABLE IF NOT EXISTS cluster_summaries (
    domain_id    TEXT NOT NULL,
    cluster_id   TEXT NOT NULL,
    iteration    INTEGER NOT NULL,
    member_count INTEGER NOT NULL,
    main_theme   TEXT NOT NULL,
    key_concepts TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (domain_id, cluster_id, iteration)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
