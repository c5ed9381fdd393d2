//! Error types for enrichflow.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every variant carries a [`FailureClass`] so the backoff runner can decide
//! whether a failed call is worth another attempt.

use std::path::PathBuf;
use std::time::Duration;

/// Whether a failed call may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, 5xx, 429, network and transient store errors.
    Retriable,
    /// Everything else: retrying cannot change the outcome.
    Terminal,
}

/// Top-level error type for all enrichflow operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed, missing or mistyped submission input.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Queue, store or network hiccup that a later attempt may clear.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Every enrichment attempt was consumed without a usable result.
    #[error("enrichment exhausted after {attempts} attempts: {last_error}")]
    EnrichmentExhausted { attempts: u32, last_error: String },

    /// Persisting a computed result failed.
    #[error("store write error: {0}")]
    StoreWrite(String),

    /// The status sink could not be reached after retries.
    #[error("status sink unavailable: {0}")]
    SinkUnavailable(String),

    /// The sink answered but refused the update.
    #[error("status sink rejected update: {0}")]
    SinkRejected(String),

    /// Non-success HTTP status from an external service.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection-level failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// A single call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The transport succeeded but the body could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The generation service answered without a usable title and tags.
    #[error("incomplete enrichment response: {0}")]
    IncompleteResponse(String),

    /// A conditional write found the record absent or in an unexpected state.
    #[error("condition failed for {key}: {message}")]
    ConditionFailed { key: String, message: String },

    /// Database read or schema error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for the backoff runner.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::TransientIo(_)
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::IncompleteResponse(_)
            | Self::StoreWrite(_)
            | Self::SinkUnavailable(_) => FailureClass::Retriable,
            Self::Http { status, .. } => {
                if *status == 429 || *status >= 500 {
                    FailureClass::Retriable
                } else {
                    FailureClass::Terminal
                }
            }
            Self::Validation { .. }
            | Self::EnrichmentExhausted { .. }
            | Self::SinkRejected(_)
            | Self::MalformedResponse(_)
            | Self::ConditionFailed { .. }
            | Self::Storage(_)
            | Self::Config { .. }
            | Self::Io { .. } => FailureClass::Terminal,
        }
    }

    /// Shorthand for `failure_class() == Retriable`.
    pub fn is_retriable(&self) -> bool {
        self.failure_class() == FailureClass::Retriable
    }

    /// Whether this error should make the queue redeliver the whole message.
    ///
    /// Only store write failures and queue transport errors qualify; every other
    /// error resolves into a per-record status.
    pub fn triggers_redelivery(&self) -> bool {
        matches!(self, Self::StoreWrite(_) | Self::TransientIo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = PipelineError::validation("tags must be a comma-separated string or list");
        assert!(err.to_string().contains("tags must be"));

        let err = PipelineError::EnrichmentExhausted {
            attempts: 3,
            last_error: "timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "enrichment exhausted after 3 attempts: timed out"
        );
    }

    #[test]
    fn http_status_classification() {
        let retriable = [429u16, 500, 502, 503, 504];
        for status in retriable {
            let err = PipelineError::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_retriable(), "{status} should be retriable");
        }

        let terminal = [400u16, 401, 403, 404, 422];
        for status in terminal {
            let err = PipelineError::Http {
                status,
                body: String::new(),
            };
            assert_eq!(err.failure_class(), FailureClass::Terminal, "{status}");
        }
    }

    #[test]
    fn transport_failures_are_retriable() {
        assert!(PipelineError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(PipelineError::Network("connection reset".into()).is_retriable());
        assert!(PipelineError::IncompleteResponse("no tags".into()).is_retriable());
        assert!(!PipelineError::MalformedResponse("not json".into()).is_retriable());
        assert!(!PipelineError::SinkRejected("row not found".into()).is_retriable());
    }

    #[test]
    fn only_store_and_queue_errors_trigger_redelivery() {
        assert!(PipelineError::StoreWrite("throttled".into()).triggers_redelivery());
        assert!(PipelineError::TransientIo("queue down".into()).triggers_redelivery());
        assert!(!PipelineError::validation("bad").triggers_redelivery());
        assert!(
            !PipelineError::EnrichmentExhausted {
                attempts: 1,
                last_error: String::new()
            }
            .triggers_redelivery()
        );
        assert!(!PipelineError::SinkUnavailable("down".into()).triggers_redelivery());
    }
}
