//! Core domain types for enrichflow content records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh content identifier (UUID v7, time-sortable).
pub fn new_content_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// ContentKey
// ---------------------------------------------------------------------------

/// Store address of a record: `(content_id, content_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    pub content_id: String,
    pub content_type: String,
}

impl ContentKey {
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
        }
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.content_id, self.content_type)
    }
}

// ---------------------------------------------------------------------------
// RecordStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a content record.
///
/// `RECEIVED → INGESTED → PROCESSED | LLM_ERROR | STORE_ERROR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Received,
    Ingested,
    Processed,
    LlmError,
    StoreError,
}

impl RecordStatus {
    /// Canonical upper-case form used at rest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Ingested => "INGESTED",
            Self::Processed => "PROCESSED",
            Self::LlmError => "LLM_ERROR",
            Self::StoreError => "STORE_ERROR",
        }
    }

    /// Lower-case form sent to the status sink.
    pub fn sink_label(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Ingested => "ingested",
            Self::Processed => "processed",
            Self::LlmError => "llm_error",
            Self::StoreError => "store_error",
        }
    }

    /// PROCESSED, LLM_ERROR and STORE_ERROR are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::LlmError | Self::StoreError)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Ingested => 1,
            Self::Processed | Self::LlmError | Self::StoreError => 2,
        }
    }

    /// Whether moving from `self` to `next` follows the forward-only lattice.
    ///
    /// Re-entering the same non-terminal state is allowed (a pre-terminal
    /// modify); a terminal state never moves again without reprocessing.
    pub fn can_advance_to(&self, next: RecordStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || next == *self
    }

    /// All statuses that count as terminal.
    pub fn terminal() -> [RecordStatus; 3] {
        [Self::Processed, Self::LlmError, Self::StoreError]
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(Self::Received),
            "INGESTED" => Ok(Self::Ingested),
            "PROCESSED" => Ok(Self::Processed),
            "LLM_ERROR" => Ok(Self::LlmError),
            "STORE_ERROR" => Ok(Self::StoreError),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TagSet
// ---------------------------------------------------------------------------

/// A normalized set of strings: trimmed, deduplicated, never containing "".
///
/// Used for `tags`, `media_link` and `generated_tags`. Ordering is stable so
/// fingerprints and payloads are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a comma-joined string into a set.
    pub fn from_csv(raw: &str) -> Self {
        raw.split(',').collect()
    }

    pub fn insert(&mut self, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        self.0.insert(value.to_string())
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for item in iter {
            set.insert(item.as_ref());
        }
        set
    }
}

// ---------------------------------------------------------------------------
// ContentRecord
// ---------------------------------------------------------------------------

/// The unit of work tracked through ingestion, enrichment and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub content_id: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "TagSet::is_empty")]
    pub media_link: TagSet,
    #[serde(default, skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_description: Option<String>,
    #[serde(default, skip_serializing_if = "TagSet::is_empty")]
    pub generated_tags: TagSet,

    pub status: RecordStatus,
    /// Last failure summary for LLM_ERROR / STORE_ERROR records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,

    /// Number of enrichment attempts consumed.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub sheet_reported: bool,

    /// SHA-256 over the normalized submission fields.
    #[serde(default)]
    pub content_hash: String,
    /// Queue message that produced the current submission fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
    /// Consumer batch that wrote the current submission fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_request_id: Option<String>,
}

impl ContentRecord {
    /// A fresh record in `RECEIVED` state with no optional fields.
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            description: None,
            url: None,
            media_link: TagSet::new(),
            tags: TagSet::new(),
            generated_title: None,
            generated_description: None,
            generated_tags: TagSet::new(),
            status: RecordStatus::Received,
            error_details: None,
            ingested_at: None,
            processed_at: None,
            reported_at: None,
            retry_count: 0,
            sheet_reported: false,
            content_hash: String::new(),
            source_message_id: None,
            ingest_request_id: None,
        }
    }

    pub fn key(&self) -> ContentKey {
        ContentKey::new(&self.content_id, &self.content_type)
    }

    /// True once both a non-empty generated title and generated tags exist.
    pub fn has_generated_content(&self) -> bool {
        self.generated_title
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
            && !self.generated_tags.is_empty()
    }
}

/// Fingerprint the submission fields of a record.
///
/// Only caller-supplied content participates; lifecycle and provenance fields
/// do not, so a redelivered message hashes identically.
pub fn content_fingerprint(record: &ContentRecord) -> String {
    let mut hasher = Sha256::new();
    // Every value is length-prefixed so no two field or list layouts share
    // a byte stream: `["a,b"]` and `["a", "b"]` hash differently.
    let mut field = |name: &str, values: &[&str]| {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.update([0x1e]);
    };

    let tags = record.tags.to_vec();
    let media = record.media_link.to_vec();
    field("content_type", &[&record.content_type]);
    field("description", &[record.description.as_deref().unwrap_or("")]);
    field("url", &[record.url.as_deref().unwrap_or("")]);
    field("tags", &tags.iter().map(String::as_str).collect::<Vec<_>>());
    field("media_link", &media.iter().map(String::as_str).collect::<Vec<_>>());

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// StatusUpdate
// ---------------------------------------------------------------------------

/// Status payload pushed to the status sink for a terminal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub content_id: String,
    /// Lower-case status label (`processed`, `llm_error`, ...).
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl StatusUpdate {
    /// Build the payload for a record. Returns `None` while the record is
    /// not yet terminal.
    pub fn for_record(record: &ContentRecord, error_summary_len: usize) -> Option<Self> {
        if !record.status.is_terminal() {
            return None;
        }

        let mut update = Self {
            content_id: record.content_id.clone(),
            status: record.status.sink_label().to_string(),
            processed_at: record.processed_at,
            generated_title: None,
            generated_tags: None,
            error_details: None,
        };

        if record.status == RecordStatus::Processed {
            update.generated_title = record.generated_title.clone();
            update.generated_tags = Some(record.generated_tags.to_vec());
        } else {
            let details = record
                .error_details
                .as_deref()
                .unwrap_or("unknown error");
            update.error_details = Some(truncate_chars(details, error_summary_len));
        }

        Some(update)
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_set_normalizes_csv() {
        let tags = TagSet::from_csv(" data, airflow ,,data, ");
        assert_eq!(tags.len(), 2);
        assert!(tags.contains("data"));
        assert!(tags.contains("airflow"));
    }

    #[test]
    fn tag_set_serializes_as_list() {
        let tags: TagSet = ["etl", "airflow"].into_iter().collect();
        let json = serde_json::to_string(&tags).expect("serialize");
        assert_eq!(json, r#"["airflow","etl"]"#);
    }

    #[test]
    fn status_lattice_moves_forward_only() {
        use RecordStatus::*;
        assert!(Received.can_advance_to(Ingested));
        assert!(Ingested.can_advance_to(Ingested));
        assert!(Ingested.can_advance_to(Processed));
        assert!(Ingested.can_advance_to(LlmError));
        assert!(!Ingested.can_advance_to(Received));
        assert!(!Processed.can_advance_to(Ingested));
        assert!(!LlmError.can_advance_to(Processed));
    }

    #[test]
    fn status_string_forms() {
        assert_eq!(RecordStatus::LlmError.as_str(), "LLM_ERROR");
        assert_eq!(RecordStatus::LlmError.sink_label(), "llm_error");
        assert_eq!(
            "store_error".parse::<RecordStatus>(),
            Ok(RecordStatus::StoreError)
        );
        assert!("DONE".parse::<RecordStatus>().is_err());

        let json = serde_json::to_string(&RecordStatus::Processed).expect("serialize");
        assert_eq!(json, r#""PROCESSED""#);
    }

    #[test]
    fn fingerprint_ignores_lifecycle_fields() {
        let mut a = ContentRecord::new("c1", "post");
        a.description = Some("I shipped a new pipeline".into());
        a.tags = TagSet::from_csv("data,airflow");

        let mut b = a.clone();
        b.status = RecordStatus::Processed;
        b.retry_count = 3;
        b.source_message_id = Some("m-2".into());
        assert_eq!(content_fingerprint(&a), content_fingerprint(&b));

        b.description = Some("something else".into());
        assert_ne!(content_fingerprint(&a), content_fingerprint(&b));
        assert_eq!(content_fingerprint(&a).len(), 64);
    }

    #[test]
    fn fingerprint_separates_list_items() {
        let mut joined = ContentRecord::new("c1", "post");
        joined.tags = ["airflow,data"].into_iter().collect();
        let mut split = joined.clone();
        split.tags = TagSet::from_csv("airflow,data");
        assert_ne!(content_fingerprint(&joined), content_fingerprint(&split));

        let mut media = joined.clone();
        media.tags = TagSet::new();
        media.media_link = ["airflow,data"].into_iter().collect();
        assert_ne!(content_fingerprint(&joined), content_fingerprint(&media));
    }

    #[test]
    fn generated_content_requires_title_and_tags() {
        let mut record = ContentRecord::new("c1", "post");
        assert!(!record.has_generated_content());
        record.generated_title = Some("Shipping Smarter".into());
        assert!(!record.has_generated_content());
        record.generated_tags = TagSet::from_csv("etl");
        assert!(record.has_generated_content());
        record.generated_title = Some("   ".into());
        assert!(!record.has_generated_content());
    }

    #[test]
    fn status_update_for_terminal_records_only() {
        let mut record = ContentRecord::new("c1", "post");
        record.status = RecordStatus::Ingested;
        assert!(StatusUpdate::for_record(&record, 500).is_none());

        record.status = RecordStatus::Processed;
        record.generated_title = Some("Shipping Smarter".into());
        record.generated_tags = TagSet::from_csv("etl,airflow");
        let update = StatusUpdate::for_record(&record, 500).expect("terminal");
        assert_eq!(update.status, "processed");
        assert_eq!(update.generated_tags.as_deref().map(<[String]>::len), Some(2));
        assert!(update.error_details.is_none());
    }

    #[test]
    fn error_summary_is_truncated() {
        let mut record = ContentRecord::new("c1", "post");
        record.status = RecordStatus::LlmError;
        record.error_details = Some("é".repeat(600));

        let update = StatusUpdate::for_record(&record, 500).expect("terminal");
        assert_eq!(update.status, "llm_error");
        assert_eq!(update.error_details.map(|d| d.chars().count()), Some(500));
        assert!(update.generated_title.is_none());
    }
}
