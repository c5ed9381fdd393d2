//! Pipeline supervisor: queue → ingestion → change feed → enrichment →
//! hand-off → reconciliation, plus the periodic sweep.
//!
//! [`Pipeline::run`] spawns one task per stage and stops them all when the
//! [`CancellationToken`] fires, waiting for in-flight enrichments to finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use enrichflow_clients::{EnrichmentClient, StatusSink};
use enrichflow_shared::{AppConfig, ContentKey, ContentRecord, RecordStatus, Result};
use enrichflow_storage::{ChangeEvent, RecordStore, ScanFilter};

use crate::ingestion::{IngestionConfig, IngestionConsumer};
use crate::queue::SubmissionQueue;
use crate::reconciler::{ReconcilerConfig, StatusReconciler};
use crate::worker::{EnrichmentWorker, WorkerConfig, WorkerOutcome};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ingestion: IngestionConfig,
    pub worker: WorkerConfig,
    pub reconciler: ReconcilerConfig,
    /// Wait between receives when the queue is empty.
    pub poll_interval: Duration,
    /// Depth of the worker → reconciler hand-off channel.
    pub handoff_capacity: usize,
    /// How often [`Pipeline::run_until_idle`] checks for remaining work.
    pub idle_check_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            ingestion: IngestionConfig::from(config),
            worker: WorkerConfig::from(config),
            reconciler: ReconcilerConfig::from(config),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            handoff_capacity: config.reconciler.handoff_capacity.max(1),
            idle_check_interval: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PipelineStats {
    batches: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    processed: AtomicUsize,
    llm_errors: AtomicUsize,
    dead_lettered: AtomicUsize,
    skipped: AtomicUsize,
}

impl PipelineStats {
    fn observe(&self, outcome: &WorkerOutcome) {
        let counter = match outcome {
            WorkerOutcome::Processed { .. } | WorkerOutcome::AlreadyEnriched => &self.processed,
            WorkerOutcome::Failed { .. } => &self.llm_errors,
            WorkerOutcome::DeadLettered { .. } => &self.dead_lettered,
            WorkerOutcome::Skipped | WorkerOutcome::Superseded => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineReport {
        PipelineReport {
            batches: self.batches.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            llm_errors: self.llm_errors.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub batches: usize,
    /// Messages persisted, including unchanged duplicates.
    pub accepted: usize,
    /// Messages rejected by validation (each delivery counts).
    pub rejected: usize,
    pub processed: usize,
    pub llm_errors: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// Keys currently being enriched. An event for a key that is already in
/// flight is not dispatched again; it marks the key so the holder runs once
/// more after the current attempt, picking up content that changed meanwhile.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashMap<ContentKey, bool>>);

impl InFlight {
    /// Claim `key`, or flag it for another pass if someone else holds it.
    fn claim(&self, key: &ContentKey) -> bool {
        let mut keys = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match keys.get_mut(key) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                keys.insert(key.clone(), false);
                true
            }
        }
    }

    /// Release `key` unless another pass was requested while it was held;
    /// returns true, keeping the claim, in that case.
    fn finish(&self, key: &ContentKey) -> bool {
        let mut keys = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match keys.get_mut(key) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                keys.remove(key);
                false
            }
        }
    }

    fn release(&self, key: &ContentKey) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// Enrich a claimed record, once more for every pass requested while it ran.
/// Returns the last outcome that did more than skip.
async fn enrich_claimed(
    worker: &EnrichmentWorker,
    stats: &PipelineStats,
    in_flight: &InFlight,
    record: &ContentRecord,
) -> WorkerOutcome {
    let key = record.key();
    let mut outcome = worker.process_event(record).await;
    stats.observe(&outcome);
    while in_flight.finish(&key) {
        debug!(key = %key, "record changed while in flight, enriching again");
        let again = worker.process_event(record).await;
        if again != WorkerOutcome::Skipped {
            stats.observe(&again);
            outcome = again;
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn SubmissionQueue>,
    ingestion: Arc<IngestionConsumer>,
    worker: Arc<EnrichmentWorker>,
    reconciler: Option<Arc<StatusReconciler>>,
    handoff: Mutex<Option<mpsc::Receiver<ContentKey>>>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    in_flight: Arc<InFlight>,
}

impl Pipeline {
    /// Wire the stages together. Without a sink, statuses are never reported.
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn SubmissionQueue>,
        client: Arc<dyn EnrichmentClient>,
        sink: Option<Arc<dyn StatusSink>>,
        config: PipelineConfig,
    ) -> Self {
        let ingestion = IngestionConsumer::new(store.clone(), config.ingestion.clone());
        let mut worker = EnrichmentWorker::new(store.clone(), client, config.worker.clone());

        let (reconciler, handoff) = match sink {
            Some(sink) => {
                let (tx, rx) = mpsc::channel(config.handoff_capacity);
                worker = worker.with_handoff(tx);
                let reconciler =
                    StatusReconciler::new(store.clone(), sink, config.reconciler.clone());
                (Some(Arc::new(reconciler)), Some(rx))
            }
            None => {
                warn!("no status sink configured, statuses will not be reported");
                (None, None)
            }
        };

        Self {
            store,
            queue,
            ingestion: Arc::new(ingestion),
            worker: Arc::new(worker),
            reconciler,
            handoff: Mutex::new(handoff),
            config,
            stats: Arc::new(PipelineStats::default()),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn report(&self) -> PipelineReport {
        self.stats.snapshot()
    }

    /// Run every stage until `cancel` fires.
    ///
    /// The hand-off channel is consumed by the first call; later calls run
    /// without the fast path and rely on the sweep.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<PipelineReport> {
        // Subscribe before ingesting so no insert is missed, then pick up
        // whatever was left pending by an earlier run.
        let events = self.store.subscribe();
        let pending = self.store.scan(&pre_terminal()).await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "resuming pending records");
        }
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(consume_loop(
            self.ingestion.clone(),
            self.queue.clone(),
            self.stats.clone(),
            self.config.poll_interval,
            cancel.child_token(),
        )));

        tasks.push(tokio::spawn(dispatch_loop(
            Dispatcher {
                store: self.store.clone(),
                worker: self.worker.clone(),
                stats: self.stats.clone(),
                in_flight: self.in_flight.clone(),
                workers: self.config.worker.workers.max(1),
            },
            pending,
            events,
            cancel.child_token(),
        )));

        if let Some(reconciler) = &self.reconciler {
            let handoff = self
                .handoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(receiver) = handoff {
                let reconciler = reconciler.clone();
                let token = cancel.child_token();
                tasks.push(tokio::spawn(async move {
                    reconciler.run_handoff(receiver, token).await;
                }));
            }

            let reconciler = reconciler.clone();
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                reconciler.run_sweeps(token).await;
            }));
        }

        info!(stages = tasks.len(), "pipeline started");
        cancel.cancelled().await;

        for handle in tasks {
            if let Err(e) = handle.await {
                error!(error = %e, "pipeline stage panicked");
            }
        }

        let report = self.stats.snapshot();
        info!(?report, "pipeline stopped");
        Ok(report)
    }

    /// Run until the queue is drained and no record awaits enrichment, then
    /// sweep once so every terminal status reaches the sink.
    pub async fn run_until_idle(&self, shutdown: CancellationToken) -> Result<PipelineReport> {
        let cancel = shutdown.child_token();

        let watcher = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_check_interval) => {}
                }
                match self.is_idle().await {
                    Ok(true) => {
                        debug!("pipeline idle, stopping");
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "idle check failed"),
                }
            }
        };

        let (report, ()) = tokio::join!(self.run(cancel.clone()), watcher);
        let report = report?;

        if let Some(reconciler) = &self.reconciler {
            if !shutdown.is_cancelled() {
                reconciler.sweep().await?;
            }
        }
        Ok(report)
    }

    /// Reset a record to `INGESTED` and enrich it again right away.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reprocess(&self, key: &ContentKey) -> Result<WorkerOutcome> {
        if !self.in_flight.claim(key) {
            info!("record already being enriched");
            return Ok(WorkerOutcome::Skipped);
        }

        let record = match self.store.reprocess(key).await {
            Ok(record) => record,
            Err(e) => {
                self.in_flight.release(key);
                return Err(e);
            }
        };
        let outcome = enrich_claimed(&self.worker, &self.stats, &self.in_flight, &record).await;

        if let Some(reconciler) = &self.reconciler {
            let reconciled = reconciler.reconcile(key).await?;
            debug!(?reconciled, "reprocessed record reconciled");
        }
        Ok(outcome)
    }

    async fn is_idle(&self) -> Result<bool> {
        if self.queue.pending().await? > 0 || !self.in_flight.is_empty() {
            return Ok(false);
        }
        let waiting = self.store.scan(&pre_terminal().with_limit(1)).await?;
        Ok(waiting.is_empty())
    }
}

fn pre_terminal() -> ScanFilter {
    ScanFilter {
        statuses: vec![RecordStatus::Received, RecordStatus::Ingested],
        ..ScanFilter::default()
    }
}

// ---------------------------------------------------------------------------
// Stage loops
// ---------------------------------------------------------------------------

async fn consume_loop(
    ingestion: Arc<IngestionConsumer>,
    queue: Arc<dyn SubmissionQueue>,
    stats: Arc<PipelineStats>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let idle = match ingestion.drain_once(queue.as_ref()).await {
            Ok(Some(outcome)) => {
                stats.batches.fetch_add(1, Ordering::Relaxed);
                stats
                    .accepted
                    .fetch_add(outcome.succeeded.len(), Ordering::Relaxed);
                stats
                    .rejected
                    .fetch_add(outcome.failed.len(), Ordering::Relaxed);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "batch failed, queue will redeliver");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    debug!("consumer loop stopped");
}

struct Dispatcher {
    store: Arc<dyn RecordStore>,
    worker: Arc<EnrichmentWorker>,
    stats: Arc<PipelineStats>,
    in_flight: Arc<InFlight>,
    workers: usize,
}

impl Dispatcher {
    /// Start enriching `record` unless it is terminal or already in flight.
    fn dispatch(
        &self,
        semaphore: &Arc<Semaphore>,
        running: &mut JoinSet<()>,
        record: ContentRecord,
    ) {
        if record.status.is_terminal() {
            return;
        }
        let key = record.key();
        if !self.in_flight.claim(&key) {
            debug!(key = %key, "record already in flight, queued another pass");
            return;
        }

        let semaphore = semaphore.clone();
        let worker = self.worker.clone();
        let stats = self.stats.clone();
        let in_flight = self.in_flight.clone();
        running.spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    enrich_claimed(&worker, &stats, &in_flight, &record).await;
                }
                Err(_) => in_flight.release(&key),
            }
        });
    }
}

/// Fan change events out to enrichment tasks, at most `workers` at a time.
async fn dispatch_loop(
    ctx: Dispatcher,
    pending: Vec<ContentRecord>,
    mut events: broadcast::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(ctx.workers));
    let mut running = JoinSet::new();
    for record in pending {
        ctx.dispatch(&semaphore, &mut running, record);
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => ctx.dispatch(&semaphore, &mut running, event.record),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Dispatch directly; re-publishing would overflow the feed again.
                warn!(skipped, "change feed lagged, dispatching pending records");
                match ctx.store.scan(&pre_terminal()).await {
                    Ok(records) => {
                        for record in records {
                            ctx.dispatch(&semaphore, &mut running, record);
                        }
                    }
                    Err(e) => error!(error = %e, "could not scan for pending records"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        while let Some(finished) = running.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "enrichment task panicked");
            }
        }
    }

    // Let in-flight enrichments finish and persist.
    while let Some(finished) = running.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "enrichment task panicked");
        }
    }
    debug!("dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::testing::{ResubmittingClient, ScriptedClient, ScriptedSink};
    use chrono::Utc;
    use enrichflow_shared::{BackoffPolicy, PipelineError};
    use enrichflow_storage::MemoryStore;

    fn fast_config() -> PipelineConfig {
        let fast = BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let mut config = PipelineConfig::default();
        config.poll_interval = Duration::from_millis(5);
        config.idle_check_interval = Duration::from_millis(20);
        config.worker.attempt_timeout = Duration::from_millis(50);
        config.worker.backoff = fast;
        config.worker.redelivery = fast;
        config.reconciler.backoff = fast;
        config.reconciler.chunk_delay = Duration::from_millis(1);
        config.reconciler.sweep_interval = Duration::from_secs(3600);
        config
    }

    fn build(
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        client: Arc<ScriptedClient>,
        sink: Arc<ScriptedSink>,
    ) -> Pipeline {
        Pipeline::new(store, queue, client, Some(sink), fast_config())
    }

    #[tokio::test]
    async fn submission_flows_to_reported() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        queue
            .send(r#"{"content_type":"post","description":"I shipped a new pipeline","tags":"data,airflow"}"#)
            .expect("send");

        let pipeline = build(store.clone(), queue.clone(), client.clone(), sink.clone());
        let report = pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(report.accepted, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(client.calls(), 1);

        let records = store.scan(&ScanFilter::default()).await.expect("scan");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, RecordStatus::Processed);
        assert!(record.generated_title.is_some());
        assert_eq!(record.generated_tags.len(), 3);
        assert!(record.sheet_reported);

        let sent = sink.received();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|u| u.content_id == record.content_id && u.status == "processed"));
    }

    #[tokio::test]
    async fn failing_enrichment_reports_llm_error() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::with_fallback(|| {
            Err(PipelineError::Network("connection reset".into()))
        }));
        let sink = Arc::new(ScriptedSink::accepting());
        queue
            .send(r#"{"content_id":"c1","content_type":"article","description":"x"}"#)
            .expect("send");

        let pipeline = build(store.clone(), queue, client.clone(), sink.clone());
        let report = pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(report.llm_errors, 1);
        assert_eq!(client.calls(), 3);

        let record = store
            .get(&ContentKey::new("c1", "article"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, RecordStatus::LlmError);
        assert_eq!(record.retry_count, 3);
        assert!(record.sheet_reported);
        assert!(sink.received().iter().any(|u| u.status == "llm_error"));
    }

    #[tokio::test]
    async fn malformed_messages_do_not_block_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(2));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        for i in 1..=5 {
            let body = if i == 3 {
                "{\"content_type\": ".to_string()
            } else {
                format!(r#"{{"content_id":"c{i}","content_type":"post","description":"item {i}"}}"#)
            };
            queue.send(body).expect("send");
        }

        let pipeline = build(store.clone(), queue.clone(), client.clone(), sink);
        let report = pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(report.accepted, 4);
        assert_eq!(report.processed, 4);
        assert_eq!(client.calls(), 4);
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_submission_is_enriched_once() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        let body = r#"{"content_id":"c1","content_type":"post","description":"same","tags":["a"]}"#;
        queue.send(body).expect("send");
        queue.send(body).expect("send");

        let pipeline = build(store.clone(), queue, client.clone(), sink);
        pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(store.len(), 1);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn reprocess_enriches_again_and_reports() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        queue
            .send(r#"{"content_id":"c1","content_type":"post","description":"x"}"#)
            .expect("send");

        let pipeline = build(store.clone(), queue, client.clone(), sink.clone());
        pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(client.calls(), 1);

        let key = ContentKey::new("c1", "post");
        let outcome = pipeline.reprocess(&key).await.expect("reprocess");
        assert_eq!(outcome, WorkerOutcome::Processed { attempts: 1 });
        assert_eq!(client.calls(), 2);

        let record = store.get(&key).await.expect("get").expect("record");
        assert_eq!(record.status, RecordStatus::Processed);
        assert!(record.sheet_reported);
    }

    #[tokio::test]
    async fn lagging_feed_dispatches_pending_records() {
        let store = Arc::new(MemoryStore::with_capacity(1));
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        for i in 0..8 {
            queue
                .send(format!(r#"{{"content_id":"c{i}","content_type":"post","description":"d{i}"}}"#))
                .expect("send");
        }

        let pipeline = build(store.clone(), queue, client.clone(), sink);
        pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");

        let pending = store.scan(&pre_terminal()).await.expect("scan");
        assert!(pending.is_empty());
        assert_eq!(client.calls(), 8);
    }

    #[tokio::test]
    async fn resumes_records_left_pending_by_an_earlier_run() {
        let store = Arc::new(MemoryStore::new());
        let mut record = ContentRecord::new("c1", "post");
        record.status = RecordStatus::Ingested;
        record.description = Some("ingested before the pipeline started".into());
        record.ingested_at = Some(Utc::now());
        store.upsert(record).await.expect("seed");

        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        let sink = Arc::new(ScriptedSink::accepting());
        let pipeline = build(store.clone(), queue, client.clone(), sink.clone());
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run_until_idle(CancellationToken::new()),
        )
        .await
        .expect("pipeline went idle")
        .expect("run");

        assert_eq!(report.processed, 1);
        assert_eq!(client.calls(), 1);
        let stored = store
            .get(&ContentKey::new("c1", "post"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stored.status, RecordStatus::Processed);
        assert!(stored.sheet_reported);
        assert!(!sink.received().is_empty());
    }

    #[tokio::test]
    async fn resubmission_while_in_flight_is_enriched_again() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        queue
            .send(r#"{"content_id":"c1","content_type":"post","description":"OLD description"}"#)
            .expect("send");

        let mut edited = ContentRecord::new("c1", "post");
        edited.status = RecordStatus::Ingested;
        edited.description = Some("NEW description".into());
        edited.ingested_at = Some(Utc::now());
        let client = Arc::new(ResubmittingClient::new(store.clone(), edited));
        let sink = Arc::new(ScriptedSink::accepting());

        let pipeline = Pipeline::new(
            store.clone(),
            queue,
            client.clone(),
            Some(sink.clone()),
            fast_config(),
        );
        tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run_until_idle(CancellationToken::new()),
        )
        .await
        .expect("pipeline went idle")
        .expect("run");

        assert_eq!(client.calls(), 2);
        let stored = store
            .get(&ContentKey::new("c1", "post"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stored.status, RecordStatus::Processed);
        assert_eq!(stored.description.as_deref(), Some("NEW description"));
        assert_eq!(stored.generated_title.as_deref(), Some("Title for NEW description"));
        assert!(stored.sheet_reported);
        assert!(
            sink.received()
                .iter()
                .all(|u| u.generated_title.as_deref() == Some("Title for NEW description"))
        );
    }

    #[tokio::test]
    async fn runs_without_sink() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(3));
        let client = Arc::new(ScriptedClient::succeeding());
        queue
            .send(r#"{"content_type":"post","description":"x"}"#)
            .expect("send");

        let pipeline = Pipeline::new(store.clone(), queue, client, None, fast_config());
        let report = pipeline
            .run_until_idle(CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(report.processed, 1);

        let records = store.scan(&ScanFilter::default()).await.expect("scan");
        assert!(!records[0].sheet_reported);
    }
}
