//! Pipeline stages for enrichflow.
//!
//! - [`ingestion`]: queue batches → validated `INGESTED` records
//! - [`worker`]: change events → generated title, description and tags
//! - [`reconciler`]: terminal statuses → status sink
//! - [`pipeline`]: runs the stages together under one cancellation token

pub mod ingestion;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod submission;
pub mod worker;

#[cfg(test)]
mod testing;

pub use ingestion::{BatchOutcome, IngestionConfig, IngestionConsumer, MessageFailure};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport};
pub use queue::{MemoryQueue, QueueMessage, SubmissionQueue};
pub use reconciler::{ReconcileOutcome, ReconcilerConfig, StatusReconciler, SweepReport};
pub use submission::{Provenance, Submission, parse_submission};
pub use worker::{EnrichmentWorker, WorkerConfig, WorkerOutcome};
