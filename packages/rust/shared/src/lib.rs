//! Shared types, error model, configuration, and retry policy for enrichflow.
//!
//! This crate is the foundation depended on by all other enrichflow crates.
//! It provides:
//! - [`PipelineError`], the unified error type and its retry classification
//! - Domain types ([`ContentRecord`], [`RecordStatus`], [`ContentKey`], [`TagSet`])
//! - Configuration ([`AppConfig`], config loading)
//! - The [`BackoffPolicy`] and the [`retry`] runner used around every unreliable call

pub mod backoff;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use backoff::{BackoffPolicy, RetryOutcome, retry};
pub use config::{
    AppConfig, EnrichmentSection, QueueSection, ReconcilerSection, SinkSection, StoreSection,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{FailureClass, PipelineError, Result};
pub use types::{
    ContentKey, ContentRecord, RecordStatus, StatusUpdate, TagSet, content_fingerprint,
    new_content_id, truncate_chars,
};
