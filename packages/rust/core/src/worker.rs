//! Enrichment worker: `INGESTED` record → `PROCESSED` or `LLM_ERROR`.
//!
//! Each record gets a bounded number of generation attempts under the
//! enrichment [`BackoffPolicy`]. The outcome is written with a conditional
//! update, so a record that already reached a terminal status is never
//! overwritten. After every terminal write the record key is handed to the
//! status reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use enrichflow_clients::{EnrichmentClient, GeneratedContent, GenerationRequest};
use enrichflow_shared::{
    AppConfig, BackoffPolicy, ContentKey, ContentRecord, PipelineError, RecordStatus, Result,
    RetryOutcome, retry,
};
use enrichflow_storage::{Condition, RecordStore, RecordUpdate};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard ceiling for one generation attempt.
    pub attempt_timeout: Duration,
    /// Generation attempts per record.
    pub backoff: BackoffPolicy,
    /// Deliveries of one change event before the record is marked `STORE_ERROR`.
    pub redelivery: BackoffPolicy,
    /// Records enriched concurrently by the dispatcher.
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(240),
            backoff: BackoffPolicy::new(10, Duration::from_secs(1), Duration::from_secs(60)),
            redelivery: BackoffPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60)),
            workers: 4,
        }
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.enrichment;
        let backoff = BackoffPolicy::from(section);
        Self {
            attempt_timeout: Duration::from_secs(section.timeout_secs),
            backoff,
            redelivery: BackoffPolicy::new(
                section.max_deliveries,
                backoff.base_delay,
                backoff.max_delay,
            ),
            workers: section.workers,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Record vanished or was already terminal; nothing to do.
    Skipped,
    /// Generated content was already present; status confirmed without a call.
    AlreadyEnriched,
    /// Another writer finished the record first.
    Superseded,
    Processed { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// Every delivery failed to persist; marked `STORE_ERROR`.
    DeadLettered { error: String },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct EnrichmentWorker {
    store: Arc<dyn RecordStore>,
    client: Arc<dyn EnrichmentClient>,
    config: WorkerConfig,
    handoff: Option<mpsc::Sender<ContentKey>>,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: Arc<dyn EnrichmentClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
            handoff: None,
        }
    }

    /// Hand terminal records to the status reconciler over `sender`.
    pub fn with_handoff(mut self, sender: mpsc::Sender<ContentKey>) -> Self {
        self.handoff = Some(sender);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// One delivery of a change event.
    ///
    /// `Err` is returned only when the outcome could not be persisted; the
    /// caller redelivers in that case.
    #[instrument(skip_all, fields(content_id = %record.content_id, content_type = %record.content_type))]
    pub async fn handle(&self, record: &ContentRecord) -> Result<WorkerOutcome> {
        let key = record.key();

        // The event may be stale; act on what the store holds now.
        let current = self
            .store
            .get(&key)
            .await
            .map_err(|e| PipelineError::TransientIo(e.to_string()))?;
        let Some(current) = current else {
            debug!("record no longer exists");
            return Ok(WorkerOutcome::Skipped);
        };

        if current.status.is_terminal() {
            debug!(status = %current.status.as_str(), "record already terminal");
            return Ok(WorkerOutcome::Skipped);
        }

        if current.has_generated_content() {
            return self.confirm_processed(&current).await;
        }

        let request = GenerationRequest {
            content_type: current.content_type.clone(),
            description: current.description.clone(),
            tags: current.tags.clone(),
            title_hint: None,
        };

        let outcome = self.generate(&request).await;
        let attempts = outcome.attempts();
        let now = Utc::now();

        let (update, result) = match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                let GeneratedContent {
                    title,
                    description,
                    tags,
                } = value;
                (
                    RecordUpdate::processed(title, description, tags, attempts, now),
                    WorkerOutcome::Processed { attempts },
                )
            }
            RetryOutcome::Terminal { error, attempts } => {
                let error = error.to_string();
                (
                    RecordUpdate::failed(RecordStatus::LlmError, &error, Some(attempts), now),
                    WorkerOutcome::Failed { attempts, error },
                )
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                let error = PipelineError::EnrichmentExhausted {
                    attempts,
                    last_error: last_error.to_string(),
                }
                .to_string();
                (
                    RecordUpdate::failed(RecordStatus::LlmError, &error, Some(attempts), now),
                    WorkerOutcome::Failed { attempts, error },
                )
            }
        };

        // The submission may have been replaced while generation ran.
        let guard = Condition::pre_terminal().with_content_hash(current.content_hash.clone());
        match self.store.conditional_update(&key, &update, &guard).await {
            Ok(_) => {}
            Err(PipelineError::ConditionFailed { message, .. }) => {
                info!(reason = %message, "record finished or resubmitted elsewhere, dropping result");
                return Ok(WorkerOutcome::Superseded);
            }
            Err(e) => return Err(e),
        }

        match &result {
            WorkerOutcome::Processed { .. } => info!(attempts, "record processed"),
            _ => warn!(attempts, "record marked LLM_ERROR"),
        }
        self.hand_off(key);
        Ok(result)
    }

    /// Deliver a change event, redelivering with backoff while persistence
    /// fails. When every delivery fails the record is marked `STORE_ERROR`.
    pub async fn process_event(&self, record: &ContentRecord) -> WorkerOutcome {
        match retry(&self.config.redelivery, move |_| self.handle(record)).await {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Terminal { error, attempts }
            | RetryOutcome::Exhausted {
                last_error: error,
                attempts,
            } => {
                error!(
                    content_id = %record.content_id,
                    deliveries = attempts,
                    error = %error,
                    "giving up on record"
                );
                self.mark_store_error(record.key(), &error).await;
                WorkerOutcome::DeadLettered {
                    error: error.to_string(),
                }
            }
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> RetryOutcome<GeneratedContent> {
        let timeout = self.config.attempt_timeout;
        retry(&self.config.backoff, move |attempt| async move {
            debug!(attempt, "requesting generation");
            match tokio::time::timeout(timeout, self.client.generate(request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(timeout)),
            }
        })
        .await
    }

    /// Short-circuit for records that already carry generated content.
    async fn confirm_processed(&self, record: &ContentRecord) -> Result<WorkerOutcome> {
        let update = RecordUpdate {
            status: Some(RecordStatus::Processed),
            processed_at: Some(record.processed_at.unwrap_or_else(Utc::now)),
            ..RecordUpdate::default()
        };
        let guard = Condition::pre_terminal().with_content_hash(record.content_hash.clone());
        match self.store.conditional_update(&record.key(), &update, &guard).await {
            Ok(_) | Err(PipelineError::ConditionFailed { .. }) => {}
            Err(e) => return Err(e),
        }
        debug!("generated content present, skipped enrichment");
        self.hand_off(record.key());
        Ok(WorkerOutcome::AlreadyEnriched)
    }

    /// Best effort: the store is what just failed.
    async fn mark_store_error(&self, key: ContentKey, error: &PipelineError) {
        let update = RecordUpdate::failed(RecordStatus::StoreError, error.to_string(), None, Utc::now());
        match self
            .store
            .conditional_update(&key, &update, &Condition::pre_terminal())
            .await
        {
            Ok(_) => self.hand_off(key),
            Err(e) => error!(key = %key, error = %e, "could not mark record STORE_ERROR"),
        }
    }

    fn hand_off(&self, key: ContentKey) {
        let Some(sender) = &self.handoff else {
            return;
        };
        match sender.try_send(key) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(key)) => {
                warn!(key = %key, "hand-off queue full, leaving record to the sweep");
            }
            Err(mpsc::error::TrySendError::Closed(key)) => {
                debug!(key = %key, "reconciler stopped, leaving record to the sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingStore, ResubmittingClient, ScriptedClient, generated};
    use enrichflow_shared::TagSet;
    use enrichflow_storage::MemoryStore;

    fn fast_config(max_attempts: u32) -> WorkerConfig {
        WorkerConfig {
            attempt_timeout: Duration::from_millis(20),
            backoff: BackoffPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
            redelivery: BackoffPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
            workers: 2,
        }
    }

    async fn ingested(store: &dyn RecordStore, id: &str) -> ContentRecord {
        let mut record = ContentRecord::new(id, "post");
        record.description = Some("I shipped a new pipeline".into());
        record.tags = TagSet::from_csv("data,airflow");
        record.status = RecordStatus::Ingested;
        record.ingested_at = Some(Utc::now());
        store.upsert(record).await.expect("upsert").record
    }

    #[tokio::test]
    async fn success_writes_processed_and_hands_off() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::succeeding());
        let (tx, mut rx) = mpsc::channel(4);
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3))
            .with_handoff(tx);

        let record = ingested(&*store, "c1").await;
        let outcome = worker.handle(&record).await.expect("handle");
        assert_eq!(outcome, WorkerOutcome::Processed { attempts: 1 });

        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::Processed);
        assert_eq!(stored.generated_title.as_deref(), Some(generated().title.as_str()));
        assert_eq!(stored.generated_tags.len(), 3);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.processed_at.is_some());
        assert_eq!(rx.try_recv().expect("handoff"), record.key());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(
            ScriptedClient::succeeding()
                .then(Err(PipelineError::Http {
                    status: 429,
                    body: "slow down".into(),
                }))
                .then(Err(PipelineError::IncompleteResponse("no tags".into()))),
        );
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(5));

        let record = ingested(&*store, "c1").await;
        let outcome = worker.handle(&record).await.expect("handle");
        assert_eq!(outcome, WorkerOutcome::Processed { attempts: 3 });
        assert_eq!(client.calls(), 3);

        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.retry_count, 3);
    }

    #[tokio::test]
    async fn timeouts_exhaust_to_llm_error() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::hanging());
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3));

        let record = ingested(&*store, "c1").await;
        let outcome = worker.handle(&record).await.expect("handle");
        assert!(matches!(outcome, WorkerOutcome::Failed { attempts: 3, .. }));
        assert_eq!(client.calls(), 3);

        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::LlmError);
        assert_eq!(stored.retry_count, 3);
        let details = stored.error_details.expect("error details");
        assert!(details.contains("3 attempts"), "{details}");
        assert!(details.contains("timed out"), "{details}");
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::with_fallback(|| {
            Err(PipelineError::Http {
                status: 401,
                body: "bad key".into(),
            })
        }));
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(5));

        let record = ingested(&*store, "c1").await;
        let outcome = worker.handle(&record).await.expect("handle");
        assert!(matches!(outcome, WorkerOutcome::Failed { attempts: 1, .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn existing_generated_content_skips_client() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::succeeding());
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3));

        let mut record = ContentRecord::new("c1", "post");
        record.status = RecordStatus::Ingested;
        record.generated_title = Some("Already Here".into());
        record.generated_tags = TagSet::from_csv("a,b,c");
        let record = store.upsert(record).await.expect("upsert").record;

        assert_eq!(
            worker.handle(&record).await.expect("handle"),
            WorkerOutcome::AlreadyEnriched
        );
        // Re-triggering the now-terminal record is a no-op too.
        assert_eq!(worker.handle(&record).await.expect("handle"), WorkerOutcome::Skipped);
        assert_eq!(client.calls(), 0);

        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::Processed);
        assert_eq!(stored.generated_title.as_deref(), Some("Already Here"));
    }

    #[tokio::test]
    async fn terminal_record_is_never_overwritten() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::succeeding());
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3));

        let record = ingested(&*store, "c1").await;
        store
            .conditional_update(
                &record.key(),
                &RecordUpdate::failed(RecordStatus::LlmError, "boom", Some(10), Utc::now()),
                &Condition::pre_terminal(),
            )
            .await
            .expect("fail record");

        assert_eq!(worker.handle(&record).await.expect("handle"), WorkerOutcome::Skipped);
        assert_eq!(client.calls(), 0);
        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::LlmError);
    }

    #[tokio::test]
    async fn resubmission_during_generation_supersedes_result() {
        let store = Arc::new(MemoryStore::new());
        let record = ingested(&*store, "c1").await;
        let mut edited = record.clone();
        edited.description = Some("NEW description".into());
        let client = Arc::new(ResubmittingClient::new(store.clone(), edited));
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3));

        assert_eq!(worker.handle(&record).await.expect("handle"), WorkerOutcome::Superseded);
        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::Ingested);
        assert_eq!(stored.description.as_deref(), Some("NEW description"));
        assert!(stored.generated_title.is_none());

        // The next delivery enriches what is stored now.
        assert_eq!(
            worker.handle(&record).await.expect("handle"),
            WorkerOutcome::Processed { attempts: 1 }
        );
        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.generated_title.as_deref(), Some("Title for NEW description"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_store_failure_dead_letters() {
        let inner = MemoryStore::new();
        ingested(&inner, "c1").await;
        let store = Arc::new(FailingStore::wrapping(inner));
        let client = Arc::new(ScriptedClient::succeeding());
        let worker = EnrichmentWorker::new(store.clone(), client.clone(), fast_config(3));

        let record = store
            .get(&ContentKey::new("c1", "post"))
            .await
            .expect("get")
            .expect("record");
        let outcome = worker.process_event(&record).await;
        assert!(matches!(outcome, WorkerOutcome::DeadLettered { .. }));
        // Enrichment was recomputed on each delivery.
        assert_eq!(client.calls(), 2);

        // The STORE_ERROR write also fails against this store.
        store.set_failing(false);
        let stored = store.get(&record.key()).await.expect("get").expect("record");
        assert_eq!(stored.status, RecordStatus::Ingested);
    }

    #[tokio::test]
    async fn redelivery_recovers_once_store_heals() {
        let inner = MemoryStore::new();
        let record = ingested(&inner, "c1").await;
        let store = Arc::new(FailingStore::wrapping(inner));
        store.set_failing(false);
        let client = Arc::new(ScriptedClient::succeeding());
        let worker = EnrichmentWorker::new(store.clone(), client, fast_config(3));

        let outcome = worker.process_event(&record).await;
        assert_eq!(outcome, WorkerOutcome::Processed { attempts: 1 });
    }
}
