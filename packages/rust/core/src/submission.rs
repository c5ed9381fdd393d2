//! Submission parsing, validation and normalization.
//!
//! A queue message body is a JSON object:
//! `{content_id?, content_type, description?, url?, tags?, media_link?}`.
//! `tags` and `media_link` may be a comma-joined string or a list of strings.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use enrichflow_shared::{ContentRecord, PipelineError, RecordStatus, Result, TagSet, new_content_id};

/// Fields the consumer understands; anything else is ignored.
const KNOWN_FIELDS: [&str; 6] = [
    "content_id",
    "content_type",
    "description",
    "url",
    "tags",
    "media_link",
];

/// A validated, normalized submission. Empty values are already dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// `None` when the caller left it absent or blank.
    pub content_id: Option<String>,
    pub content_type: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub tags: TagSet,
    pub media_link: TagSet,
}

/// Where a submission came from.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub message_id: String,
    pub request_id: String,
    pub received_at: DateTime<Utc>,
}

impl Submission {
    /// Build the `INGESTED` record for this submission, generating a content id
    /// when none was supplied.
    pub fn into_record(self, provenance: &Provenance) -> ContentRecord {
        let content_id = self.content_id.unwrap_or_else(new_content_id);

        let mut record = ContentRecord::new(content_id, self.content_type);
        record.description = self.description;
        record.url = self.url;
        record.tags = self.tags;
        record.media_link = self.media_link;
        record.status = RecordStatus::Ingested;
        record.ingested_at = Some(provenance.received_at);
        record.source_message_id = Some(provenance.message_id.clone());
        record.ingest_request_id = Some(provenance.request_id.clone());
        record
    }
}

/// Parse and validate one message body.
///
/// Every failure is a [`PipelineError::Validation`] scoped to this message.
pub fn parse_submission(body: &str) -> Result<Submission> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PipelineError::validation(format!("malformed payload: {e}")))?;

    let Value::Object(fields) = value else {
        return Err(PipelineError::validation("payload must be a JSON object"));
    };

    for key in fields.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            debug!(field = %key, "ignoring unknown submission field");
        }
    }

    let content_type = optional_string(&fields, "content_type")?
        .ok_or_else(|| PipelineError::validation("content_type is required"))?;

    Ok(Submission {
        content_id: optional_string(&fields, "content_id")?,
        content_type,
        description: optional_string(&fields, "description")?,
        url: optional_string(&fields, "url")?,
        tags: string_set(&fields, "tags")?,
        media_link: string_set(&fields, "media_link")?,
    })
}

/// A trimmed string field; absent, null and blank all map to `None`.
fn optional_string(fields: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(other) => Err(PipelineError::validation(format!(
            "{name} must be a string, got {}",
            json_type(other)
        ))),
    }
}

/// A comma-joined string or a list of strings, normalized into a set.
fn string_set(fields: &Map<String, Value>, name: &str) -> Result<TagSet> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(TagSet::new()),
        Some(Value::String(s)) => Ok(TagSet::from_csv(s)),
        Some(Value::Array(items)) => {
            let mut set = TagSet::new();
            for item in items {
                match item {
                    Value::String(s) => {
                        set.insert(s);
                    }
                    other => {
                        return Err(PipelineError::validation(format!(
                            "{name} must contain only strings, found {}",
                            json_type(other)
                        )));
                    }
                }
            }
            Ok(set)
        }
        Some(other) => Err(PipelineError::validation(format!(
            "{name} must be a string or a list of strings, got {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
