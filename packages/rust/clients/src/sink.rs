//! Status webhook adapter.
//!
//! Posts `{action: "updateStatus", content_id, status, ...}` and treats a 2xx
//! response whose body reports success as the acknowledgement.

use std::time::Duration;

use async_trait::async_trait;
use enrichflow_shared::{PipelineError, Result, SinkSection, StatusUpdate};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{build_client, send_error, status_error};

/// Acknowledgement returned by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkAck {
    pub message: Option<String>,
}

/// Adapter to the external status-reporting endpoint.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// One delivery attempt for `update`.
    async fn report_status(&self, update: &StatusUpdate) -> Result<SinkAck>;
}

#[derive(Serialize)]
struct SinkPayload<'a> {
    action: &'static str,
    #[serde(flatten)]
    update: &'a StatusUpdate,
}

/// [`StatusSink`] that POSTs JSON to a webhook URL.
pub struct WebhookSink {
    http: Client,
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            url: url.into(),
            timeout,
        })
    }

    /// `None` when no sink URL is configured.
    pub fn from_config(section: &SinkSection) -> Result<Option<Self>> {
        section
            .url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(section.timeout_secs)))
            .transpose()
    }
}

#[async_trait]
impl StatusSink for WebhookSink {
    #[instrument(skip_all, fields(content_id = %update.content_id, status = %update.status))]
    async fn report_status(&self, update: &StatusUpdate) -> Result<SinkAck> {
        let payload = SinkPayload {
            action: "updateStatus",
            update,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| send_error(e, self.timeout))?;
        let ack = interpret_ack(&text)?;
        debug!(message = ?ack.message, "sink acknowledged status");
        Ok(ack)
    }
}

/// Decide whether a 2xx body acknowledges the update.
///
/// Accepts `{"status": "success"}` or `{"success": true}`; anything else the
/// sink says is a rejection.
fn interpret_ack(body: &str) -> Result<SinkAck> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedResponse(format!("sink response: {e}")))?;

    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .map(String::from);

    let acknowledged = value.get("status").and_then(|s| s.as_str()) == Some("success")
        || value.get("success").and_then(|s| s.as_bool()) == Some(true);

    if acknowledged {
        Ok(SinkAck { message })
    } else {
        Err(PipelineError::SinkRejected(
            message.unwrap_or_else(|| body.chars().take(200).collect()),
        ))
    }
}
