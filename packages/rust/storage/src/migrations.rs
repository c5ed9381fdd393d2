//! SQL migration definitions for the enrichflow database.
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
            description: "Initial schema: content_records",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (content_id, content_type). Sets are stored as JSON arrays.
CREATE TABLE IF NOT EXISTS content_records (
    content_id            TEXT NOT NULL,
    content_type          TEXT NOT NULL,
    description           TEXT,
    url                   TEXT,
    media_link_json       TEXT NOT NULL DEFAULT '[]',
    tags_json             TEXT NOT NULL DEFAULT '[]',
    generated_title       TEXT,
    generated_description TEXT,
    generated_tags_json   TEXT NOT NULL DEFAULT '[]',
    status                TEXT NOT NULL,
    error_details         TEXT,
    ingested_at           TEXT,
    processed_at          TEXT,
    reported_at           TEXT,
    retry_count           INTEGER NOT NULL DEFAULT 0,
    sheet_reported        INTEGER NOT NULL DEFAULT 0,
    content_hash          TEXT NOT NULL,
    PRIMARY KEY (content_id, content_type)
);

CREATE INDEX IF NOT EXISTS idx_records_content_id ON content_records(content_id);
CREATE INDEX IF NOT EXISTS idx_records_unreported ON content_records(sheet_reported, status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Message provenance columns",
            sql: r#"
ALTER TABLE content_records ADD COLUMN source_message_id TEXT;
ALTER TABLE content_records ADD COLUMN ingest_request_id TEXT;

CREATE INDEX IF NOT EXISTS idx_records_status_ingested ON content_records(status, ingested_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
