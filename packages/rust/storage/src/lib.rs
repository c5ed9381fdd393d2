//! Record persistence for enrichflow.
//!
//! [`RecordStore`] is the contract every pipeline component talks to. Two
//! backends implement it:
//! - [`Storage`]: Turso Embedded / libSQL, used by the CLI
//! - [`MemoryStore`]: in-process map for tests and dry runs
//!
//! Both publish [`ChangeEvent`]s on a bounded broadcast channel, which is what
//! drives the enrichment worker.

mod memory;
mod migrations;
mod model;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use enrichflow_shared::{ContentKey, ContentRecord, PipelineError, RecordStatus, Result, TagSet};
use libsql::{Connection, Database, Value, params};
use tokio::sync::{Mutex, broadcast};

pub use memory::MemoryStore;
pub use model::{
    ChangeEvent, ChangeKind, Condition, RecordStore, RecordUpdate, ScanFilter, UpsertKind,
    UpsertOutcome,
};

use model::{condition_failed, plan_upsert};

/// Default change-feed depth when none is configured.
pub const DEFAULT_CHANGE_FEED_CAPACITY: usize = 1024;

const COLUMNS: &str = "content_id, content_type, description, url, media_link_json, tags_json, \
     generated_title, generated_description, generated_tags_json, status, error_details, \
     ingested_at, processed_at, reported_at, retry_count, sheet_reported, content_hash, \
     source_message_id, ingest_request_id";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes read-modify-write upserts.
    write_lock: Mutex<()>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path, change_feed_capacity: usize) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let storage = Self::connect(path, change_feed_capacity, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status inspection).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        Self::connect(path, 1, true).await
    }

    async fn connect(path: &Path, change_feed_capacity: usize, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let (changes, _) = broadcast::channel(change_feed_capacity.max(1));
        Ok(Self {
            db,
            conn,
            readonly,
            write_lock: Mutex::new(()),
            changes,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PipelineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
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
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::StoreWrite(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        let receivers = self.changes.send(event).unwrap_or(0);
        tracing::trace!(receivers, "published change event");
    }

    async fn fetch(&self, key: &ContentKey) -> Result<Option<ContentRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM content_records WHERE content_id = ?1 AND content_type = ?2"
                ),
                params![key.content_id.as_str(), key.content_type.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Write every column of `record` (insert or overwrite by key).
    async fn write_row(&self, record: &ContentRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO content_records ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                     ON CONFLICT(content_id, content_type) DO UPDATE SET
                       description = excluded.description,
                       url = excluded.url,
                       media_link_json = excluded.media_link_json,
                       tags_json = excluded.tags_json,
                       generated_title = excluded.generated_title,
                       generated_description = excluded.generated_description,
                       generated_tags_json = excluded.generated_tags_json,
                       status = excluded.status,
                       error_details = excluded.error_details,
                       ingested_at = excluded.ingested_at,
                       processed_at = excluded.processed_at,
                       reported_at = excluded.reported_at,
                       retry_count = excluded.retry_count,
                       sheet_reported = excluded.sheet_reported,
                       content_hash = excluded.content_hash,
                       source_message_id = excluded.source_message_id,
                       ingest_request_id = excluded.ingest_request_id"
                ),
                params![
                    record.content_id.as_str(),
                    record.content_type.as_str(),
                    record.description.as_deref(),
                    record.url.as_deref(),
                    tags_to_json(&record.media_link)?,
                    tags_to_json(&record.tags)?,
                    record.generated_title.as_deref(),
                    record.generated_description.as_deref(),
                    tags_to_json(&record.generated_tags)?,
                    record.status.as_str(),
                    record.error_details.as_deref(),
                    record.ingested_at.as_ref().map(timestamp),
                    record.processed_at.as_ref().map(timestamp),
                    record.reported_at.as_ref().map(timestamp),
                    i64::from(record.retry_count),
                    i64::from(record.sheet_reported),
                    record.content_hash.as_str(),
                    record.source_message_id.as_deref(),
                    record.ingest_request_id.as_deref(),
                ],
            )
            .await
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for Storage {
    async fn upsert(&self, record: ContentRecord) -> Result<UpsertOutcome> {
        self.check_writable()?;
        let guard = self.write_lock.lock().await;

        let existing = self.fetch(&record.key()).await.map_err(into_write_error)?;
        let outcome = plan_upsert(existing, record);

        let event = match outcome.kind {
            UpsertKind::Unchanged => {
                tracing::debug!(key = %outcome.record.key(), "content unchanged, skipping write");
                return Ok(outcome);
            }
            UpsertKind::Inserted => ChangeEvent::insert(outcome.record.clone()),
            UpsertKind::Updated => ChangeEvent::modify(outcome.record.clone()),
        };

        self.write_row(&outcome.record).await?;
        drop(guard);

        self.publish(event);
        Ok(outcome)
    }

    async fn get(&self, key: &ContentKey) -> Result<Option<ContentRecord>> {
        self.fetch(key).await
    }

    async fn get_by_content_id(&self, content_id: &str) -> Result<Option<ContentRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM content_records WHERE content_id = ?1
                     ORDER BY ingested_at LIMIT 1"
                ),
                params![content_id],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ContentRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if !filter.statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(filter.statuses.len())));
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if let Some(reported) = filter.sheet_reported {
            clauses.push("sheet_reported = ?".to_string());
            values.push(Value::Integer(i64::from(reported)));
        }
        if let Some(cutoff) = filter.ingested_before {
            clauses.push("ingested_at IS NOT NULL AND ingested_at < ?".to_string());
            values.push(Value::Text(timestamp(&cutoff)));
        }

        let mut sql = format!("SELECT {COLUMNS} FROM content_records");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ingested_at, content_id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?
        {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    async fn conditional_update(
        &self,
        key: &ContentKey,
        update: &RecordUpdate,
        condition: &Condition,
    ) -> Result<ContentRecord> {
        self.check_writable()?;

        let allowed = condition.allowed_statuses(update);
        if allowed.is_empty() {
            return Err(condition_failed(key, "no stored status satisfies the condition"));
        }

        let (mut sets, mut values) = update_assignments(update)?;
        if sets.is_empty() {
            sets.push("status = status".to_string());
        }

        let mut sql = format!(
            "UPDATE content_records SET {} WHERE content_id = ? AND content_type = ? AND status IN ({})",
            sets.join(", "),
            placeholders(allowed.len())
        );
        values.push(Value::Text(key.content_id.clone()));
        values.push(Value::Text(key.content_type.clone()));
        values.extend(allowed.iter().map(|s| Value::Text(s.as_str().to_string())));
        if let Some(reported) = condition.sheet_reported {
            sql.push_str(" AND sheet_reported = ?");
            values.push(Value::Integer(i64::from(reported)));
        }
        if let Some(hash) = &condition.content_hash {
            sql.push_str(" AND content_hash = ?");
            values.push(Value::Text(hash.clone()));
        }
        sql.push_str(&format!(" RETURNING {COLUMNS}"));

        let updated = {
            let _guard = self.write_lock.lock().await;
            let mut rows = self
                .conn
                .query(&sql, libsql::params::Params::Positional(values))
                .await
                .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
            match rows.next().await {
                Ok(Some(row)) => Some(row_to_record(&row)?),
                Ok(None) => None,
                Err(e) => return Err(PipelineError::StoreWrite(e.to_string())),
            }
        };

        match updated {
            Some(record) => {
                self.publish(ChangeEvent::modify(record.clone()));
                Ok(record)
            }
            None => match self.fetch(key).await? {
                None => Err(condition_failed(key, "record not found")),
                Some(current) => Err(condition_failed(
                    key,
                    format!("condition not met (status {})", current.status),
                )),
            },
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn redrive(&self, record: ContentRecord) {
        self.publish(ChangeEvent::modify(record));
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// SET clauses and their bound values for a partial update.
fn update_assignments(update: &RecordUpdate) -> Result<(Vec<String>, Vec<Value>)> {
    let mut sets: Vec<String> = Vec::new();
    let mut values = Vec::new();

    if update.reset {
        sets.extend(
            [
                "generated_title = NULL",
                "generated_description = NULL",
                "generated_tags_json = '[]'",
                "error_details = NULL",
                "processed_at = NULL",
                "reported_at = NULL",
                "retry_count = 0",
                "sheet_reported = 0",
            ]
            .map(String::from),
        );
    }

    let mut set = |column: &str, value: Value| {
        sets.push(format!("{column} = ?"));
        values.push(value);
    };

    if let Some(status) = update.status {
        set("status", Value::Text(status.as_str().to_string()));
    }
    if let Some(title) = &update.generated_title {
        set("generated_title", Value::Text(title.clone()));
    }
    if let Some(description) = &update.generated_description {
        set("generated_description", Value::Text(description.clone()));
    }
    if let Some(tags) = &update.generated_tags {
        set("generated_tags_json", Value::Text(tags_to_json(tags)?));
    }
    if let Some(details) = &update.error_details {
        set("error_details", Value::Text(details.clone()));
    }
    if let Some(at) = &update.processed_at {
        set("processed_at", Value::Text(timestamp(at)));
    }
    if let Some(at) = &update.reported_at {
        set("reported_at", Value::Text(timestamp(at)));
    }
    if let Some(count) = update.retry_count {
        set("retry_count", Value::Integer(i64::from(count)));
    }
    if let Some(reported) = update.sheet_reported {
        set("sheet_reported", Value::Integer(i64::from(reported)));
    }

    Ok((sets, values))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Fixed-width RFC 3339 so text comparison orders correctly.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    match row.get::<String>(idx).ok() {
        None => Ok(None),
        Some(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| PipelineError::Storage(format!("invalid date: {e}"))),
    }
}

fn tags_to_json(tags: &TagSet) -> Result<String> {
    serde_json::to_string(tags).map_err(|e| PipelineError::StoreWrite(e.to_string()))
}

fn tags_from_row(row: &libsql::Row, idx: i32) -> Result<TagSet> {
    let raw: String = row
        .get(idx)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::Storage(format!("invalid tag set: {e}")))
}

fn into_write_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Storage(message) => PipelineError::StoreWrite(message),
        other => other,
    }
}

/// Convert a database row (selected with [`COLUMNS`]) to a [`ContentRecord`].
fn row_to_record(row: &libsql::Row) -> Result<ContentRecord> {
    let status: String = row
        .get(9)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;

    Ok(ContentRecord {
        content_id: row
            .get::<String>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        content_type: row
            .get::<String>(1)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        description: row.get::<String>(2).ok(),
        url: row.get::<String>(3).ok(),
        media_link: tags_from_row(row, 4)?,
        tags: tags_from_row(row, 5)?,
        generated_title: row.get::<String>(6).ok(),
        generated_description: row.get::<String>(7).ok(),
        generated_tags: tags_from_row(row, 8)?,
        status: status
            .parse::<RecordStatus>()
            .map_err(PipelineError::Storage)?,
        error_details: row.get::<String>(10).ok(),
        ingested_at: parse_timestamp(row, 11)?,
        processed_at: parse_timestamp(row, 12)?,
        reported_at: parse_timestamp(row, 13)?,
        retry_count: row.get::<i64>(14).unwrap_or(0) as u32,
        sheet_reported: row.get::<i64>(15).unwrap_or(0) != 0,
        content_hash: row
            .get::<String>(16)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        source_message_id: row.get::<String>(17).ok(),
        ingest_request_id: row.get::<String>(18).ok(),
    })
}
