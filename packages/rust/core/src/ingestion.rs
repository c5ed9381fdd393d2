//! Ingestion consumer: queue batch → validated `INGESTED` records.
//!
//! Messages in a batch are processed concurrently, bounded by a semaphore.
//! A malformed message fails on its own; a store write failure fails the
//! whole batch so the queue redelivers it.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use enrichflow_shared::{AppConfig, PipelineError, Result};
use enrichflow_storage::{RecordStore, UpsertKind};

use crate::queue::{QueueMessage, SubmissionQueue};
use crate::submission::{Provenance, parse_submission};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Maximum messages of one batch in flight at once.
    pub concurrency: usize,
    /// Messages requested per `receive`.
    pub batch_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 10,
        }
    }
}

impl From<&AppConfig> for IngestionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.queue.concurrency,
            batch_size: config.queue.batch_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// A message that failed on its own and should be redelivered.
#[derive(Debug, Clone)]
pub struct MessageFailure {
    pub message_id: String,
    pub error: String,
}

/// Per-message results for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub request_id: String,
    /// Message ids that were persisted (or were unchanged duplicates).
    pub succeeded: Vec<String>,
    pub failed: Vec<MessageFailure>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl BatchOutcome {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.message_id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct IngestionConsumer {
    store: Arc<dyn RecordStore>,
    config: IngestionConfig,
}

impl IngestionConsumer {
    pub fn new(store: Arc<dyn RecordStore>, config: IngestionConfig) -> Self {
        Self { store, config }
    }

    /// Validate and persist every message of a batch.
    ///
    /// Returns `Err` only for batch-fatal failures (a store write error);
    /// everything else is reported per message in [`BatchOutcome`].
    #[instrument(skip_all, fields(batch_size = messages.len()))]
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchOutcome> {
        let request_id = Uuid::now_v7().to_string();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::with_capacity(messages.len());

        for message in messages {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let provenance = Provenance {
                message_id: message.message_id.clone(),
                request_id: request_id.clone(),
                received_at: Utc::now(),
            };
            let message_id = message.message_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::TransientIo("ingestion semaphore closed".into()))?;

                let submission = parse_submission(&message.body)?;
                let record = submission.into_record(&provenance);
                let outcome = store.upsert(record).await?;
                debug!(
                    content_id = %outcome.record.content_id,
                    kind = ?outcome.kind,
                    "submission persisted"
                );
                Ok::<_, PipelineError>(outcome.kind)
            });

            handles.push((message_id, handle));
        }

        let mut outcome = BatchOutcome {
            request_id,
            ..BatchOutcome::default()
        };
        let mut fatal: Option<PipelineError> = None;

        for (message_id, handle) in handles {
            match handle.await {
                Ok(Ok(kind)) => {
                    match kind {
                        UpsertKind::Inserted => outcome.inserted += 1,
                        UpsertKind::Updated => outcome.updated += 1,
                        UpsertKind::Unchanged => outcome.unchanged += 1,
                    }
                    outcome.succeeded.push(message_id);
                }
                Ok(Err(e)) if e.triggers_redelivery() => {
                    error!(message_id = %message_id, error = %e, "store write failed, failing batch");
                    fatal.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    warn!(message_id = %message_id, error = %e, "rejecting message");
                    outcome.failed.push(MessageFailure {
                        message_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "ingestion task panicked");
                    outcome.failed.push(MessageFailure {
                        message_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            request_id = %outcome.request_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "batch ingested"
        );
        Ok(outcome)
    }

    /// Receive one batch, process it and settle every message with the queue.
    ///
    /// `Ok(None)` means the queue had nothing to deliver.
    pub async fn drain_once(&self, queue: &dyn SubmissionQueue) -> Result<Option<BatchOutcome>> {
        let messages = queue.receive(self.config.batch_size).await?;
        if messages.is_empty() {
            return Ok(None);
        }
        let all_ids: Vec<String> = messages.iter().map(|m| m.message_id.clone()).collect();

        match self.process_batch(messages).await {
            Ok(outcome) => {
                queue.complete(&outcome.succeeded).await?;
                queue.fail(&outcome.failed_ids()).await?;
                Ok(Some(outcome))
            }
            Err(e) => {
                queue.fail(&all_ids).await?;
                Err(e)
            }
        }
    }
}
