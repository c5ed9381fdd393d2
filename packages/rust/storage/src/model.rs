//! The [`RecordStore`] contract and the write primitives shared by every
//! backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrichflow_shared::{
    ContentKey, ContentRecord, PipelineError, RecordStatus, Result, TagSet, content_fingerprint,
};
use tokio::sync::broadcast;

/// Every status, in lattice order.
pub(crate) const ALL_STATUSES: [RecordStatus; 5] = [
    RecordStatus::Received,
    RecordStatus::Ingested,
    RecordStatus::Processed,
    RecordStatus::LlmError,
    RecordStatus::StoreError,
];

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Key-value persistence for content records, keyed by `(content_id, content_type)`.
///
/// Implementations publish a [`ChangeEvent`] after every insert or modifying
/// write; unchanged upserts publish nothing.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite a record.
    ///
    /// Re-submitting content whose fingerprint matches the stored record is a
    /// no-op that returns [`UpsertKind::Unchanged`] and the stored record.
    async fn upsert(&self, record: ContentRecord) -> Result<UpsertOutcome>;

    async fn get(&self, key: &ContentKey) -> Result<Option<ContentRecord>>;

    /// First record with this id, regardless of content type.
    async fn get_by_content_id(&self, content_id: &str) -> Result<Option<ContentRecord>>;

    /// Records matching `filter`, oldest ingestion first.
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ContentRecord>>;

    /// Write only the fields set in `update`, provided `condition` holds.
    ///
    /// Fails with [`PipelineError::ConditionFailed`] when the record is absent,
    /// the condition is false, or the status change would move backwards.
    async fn conditional_update(
        &self,
        key: &ContentKey,
        update: &RecordUpdate,
        condition: &Condition,
    ) -> Result<ContentRecord>;

    /// Subscribe to insert/modify notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Re-publish a modify notification for an existing record without writing it.
    fn redrive(&self, record: ContentRecord);

    /// Reset a record to `INGESTED` so it is enriched again.
    async fn reprocess(&self, key: &ContentKey) -> Result<ContentRecord> {
        self.conditional_update(key, &RecordUpdate::reprocess(), &Condition::exists())
            .await
    }
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub kind: UpsertKind,
    /// The record as stored after the call.
    pub record: ContentRecord,
}

/// Decide what an upsert of `incoming` over `existing` writes.
/// Nothing is persisted for [`UpsertKind::Unchanged`].
pub(crate) fn plan_upsert(
    existing: Option<ContentRecord>,
    mut incoming: ContentRecord,
) -> UpsertOutcome {
    incoming.content_hash = content_fingerprint(&incoming);

    match existing {
        None => UpsertOutcome {
            kind: UpsertKind::Inserted,
            record: incoming,
        },
        Some(stored) if stored.content_hash == incoming.content_hash => UpsertOutcome {
            kind: UpsertKind::Unchanged,
            record: stored,
        },
        Some(_) => UpsertOutcome {
            kind: UpsertKind::Updated,
            record: incoming,
        },
    }
}

// ---------------------------------------------------------------------------
// Scan filter
// ---------------------------------------------------------------------------

/// Predicate for [`RecordStore::scan`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub statuses: Vec<RecordStatus>,
    pub sheet_reported: Option<bool>,
    pub ingested_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ScanFilter {
    /// Terminal records the sink has not acknowledged.
    pub fn unreported() -> Self {
        Self {
            statuses: RecordStatus::terminal().to_vec(),
            sheet_reported: Some(false),
            ..Self::default()
        }
    }

    /// Records still `INGESTED` since before `cutoff`.
    pub fn stale_ingested(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![RecordStatus::Ingested],
            ingested_before: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ContentRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(reported) = self.sheet_reported {
            if record.sheet_reported != reported {
                return false;
            }
        }
        if let Some(cutoff) = self.ingested_before {
            match record.ingested_at {
                Some(at) if at < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Field-level update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    pub generated_title: Option<String>,
    pub generated_description: Option<String>,
    pub generated_tags: Option<TagSet>,
    pub error_details: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub reported_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub sheet_reported: Option<bool>,
    /// Clear enrichment output and reporting state before applying the rest.
    /// The only way a record may leave a terminal status.
    pub reset: bool,
}

impl RecordUpdate {
    /// Successful enrichment.
    pub fn processed(
        title: String,
        description: Option<String>,
        tags: TagSet,
        retry_count: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(RecordStatus::Processed),
            generated_title: Some(title),
            generated_description: description,
            generated_tags: Some(tags),
            retry_count: Some(retry_count),
            processed_at: Some(at),
            ..Self::default()
        }
    }

    /// Terminal failure (`LLM_ERROR` or `STORE_ERROR`).
    pub fn failed(
        status: RecordStatus,
        details: impl Into<String>,
        retry_count: Option<u32>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(status),
            error_details: Some(details.into()),
            retry_count,
            processed_at: Some(at),
            ..Self::default()
        }
    }

    /// The sink acknowledged the record's current status.
    pub fn reported(at: DateTime<Utc>) -> Self {
        Self {
            sheet_reported: Some(true),
            reported_at: Some(at),
            ..Self::default()
        }
    }

    /// Explicit reprocessing request.
    pub fn reprocess() -> Self {
        Self {
            status: Some(RecordStatus::Ingested),
            reset: true,
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, record: &mut ContentRecord) {
        if self.reset {
            record.generated_title = None;
            record.generated_description = None;
            record.generated_tags = TagSet::new();
            record.error_details = None;
            record.processed_at = None;
            record.reported_at = None;
            record.retry_count = 0;
            record.sheet_reported = false;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(title) = &self.generated_title {
            record.generated_title = Some(title.clone());
        }
        if let Some(description) = &self.generated_description {
            record.generated_description = Some(description.clone());
        }
        if let Some(tags) = &self.generated_tags {
            record.generated_tags = tags.clone();
        }
        if let Some(details) = &self.error_details {
            record.error_details = Some(details.clone());
        }
        if let Some(at) = self.processed_at {
            record.processed_at = Some(at);
        }
        if let Some(at) = self.reported_at {
            record.reported_at = Some(at);
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(reported) = self.sheet_reported {
            record.sheet_reported = reported;
        }
    }
}

/// Guard evaluated against the stored record before a partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    /// Stored status must be one of these (any status when `None`).
    pub statuses: Option<Vec<RecordStatus>>,
    pub sheet_reported: Option<bool>,
    /// Stored submission fingerprint must equal this one.
    pub content_hash: Option<String>,
}

impl Condition {
    /// The record only has to exist.
    pub fn exists() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: impl IntoIterator<Item = RecordStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// `RECEIVED` or `INGESTED`.
    pub fn pre_terminal() -> Self {
        Self::status_in([RecordStatus::Received, RecordStatus::Ingested])
    }

    pub fn with_sheet_reported(mut self, reported: bool) -> Self {
        self.sheet_reported = Some(reported);
        self
    }

    /// Only apply while the submission fields are the ones that were read,
    /// so output generated from replaced content is never written.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Statuses the stored record may hold for `update` to apply, folding in
    /// the forward-only lattice.
    pub(crate) fn allowed_statuses(&self, update: &RecordUpdate) -> Vec<RecordStatus> {
        let mut allowed = self
            .statuses
            .clone()
            .unwrap_or_else(|| ALL_STATUSES.to_vec());
        if let (Some(next), false) = (update.status, update.reset) {
            allowed.retain(|current| current.can_advance_to(next));
        }
        allowed
    }

    pub(crate) fn holds(&self, record: &ContentRecord, update: &RecordUpdate) -> bool {
        if !self.allowed_statuses(update).contains(&record.status) {
            return false;
        }
        self.sheet_reported
            .is_none_or(|expected| record.sheet_reported == expected)
            && self
                .content_hash
                .as_deref()
                .is_none_or(|expected| record.content_hash == expected)
    }
}

pub(crate) fn condition_failed(key: &ContentKey, message: impl Into<String>) -> PipelineError {
    PipelineError::ConditionFailed {
        key: key.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
}

/// Notification emitted after a record is inserted or modified.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: ContentRecord,
}

impl ChangeEvent {
    pub fn insert(record: ContentRecord) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn modify(record: ContentRecord) -> Self {
        Self {
            kind: ChangeKind::Modify,
            record,
        }
    }
}
