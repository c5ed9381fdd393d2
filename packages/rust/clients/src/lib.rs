//! Adapters to the two external services the pipeline calls.
//!
//! - [`EnrichmentClient`]: text generation (OpenAI-compatible chat completions)
//! - [`StatusSink`]: status webhook backing the external system of record
//!
//! Adapters make exactly one attempt per call and report failures as
//! [`PipelineError`] variants the backoff runner can classify. Retrying is the
//! caller's business.

mod enrichment;
mod sink;

use std::time::Duration;

use enrichflow_shared::{PipelineError, Result};
use reqwest::Client;

pub use enrichment::{
    EnrichmentClient, GeneratedContent, GenerationRequest, OpenRouterClient, parse_generation,
};
pub use sink::{SinkAck, StatusSink, WebhookSink};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("enrichflow/", env!("CARGO_PKG_VERSION"));

/// Build a reqwest client with appropriate settings.
fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::config(format!("failed to build HTTP client: {e}")))
}

/// Map a transport error to the retriable variant it belongs to.
fn send_error(err: reqwest::Error, timeout: Duration) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(timeout)
    } else {
        PipelineError::Network(err.to_string())
    }
}

/// Turn a non-2xx response into [`PipelineError::Http`], keeping the body for logs.
async fn status_error(response: reqwest::Response) -> PipelineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PipelineError::Http { status, body }
}
