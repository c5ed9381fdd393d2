//! Status reconciler: pushes terminal record statuses to the status sink.
//!
//! Two triggers feed it. The fast path is a per-record hand-off from the
//! enrichment worker. The sweep periodically scans for terminal records the
//! sink has not acknowledged and pushes them in rate-limited chunks. A record
//! is marked `sheet_reported` only after the sink acknowledges it, and only
//! if its status is still the one that was reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use enrichflow_clients::StatusSink;
use enrichflow_shared::{
    AppConfig, BackoffPolicy, ContentKey, ContentRecord, PipelineError, Result, RetryOutcome,
    StatusUpdate, retry,
};
use enrichflow_storage::{Condition, RecordStore, RecordUpdate, ScanFilter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Sink delivery attempts per record.
    pub backoff: BackoffPolicy,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// No new chunk starts once a sweep has run this long.
    pub sweep_budget: Duration,
    pub sweep_interval: Duration,
    pub error_summary_len: usize,
    /// `INGESTED` records older than this are redriven by the sweep.
    pub stale_ingest_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ReconcilerConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.reconciler;
        Self {
            backoff: BackoffPolicy::from(&config.sink),
            chunk_size: section.chunk_size.max(1),
            chunk_delay: Duration::from_millis(section.chunk_delay_ms),
            sweep_budget: Duration::from_secs(section.sweep_budget_secs),
            sweep_interval: Duration::from_secs(section.sweep_interval_secs),
            error_summary_len: section.error_summary_len,
            stale_ingest_after: Duration::from_secs(section.stale_ingest_after_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    NotFound,
    /// Still `RECEIVED` or `INGESTED`.
    NotReady,
    AlreadyReported,
    Reported,
    /// Acknowledged, but the record changed status in the meantime.
    Superseded,
    /// The sink stayed unreachable; the next sweep retries.
    Unavailable { attempts: u32, error: String },
    /// The sink refused the update; the next sweep retries.
    Rejected { error: String },
}

/// Summary of one sweep or batch of reconciliations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub examined: usize,
    pub reported: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Unreported records left for the next sweep once the budget ran out.
    pub deferred: usize,
    /// Stale `INGESTED` records whose change event was re-published.
    pub redriven: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &Result<ReconcileOutcome>) {
        self.examined += 1;
        match outcome {
            Ok(ReconcileOutcome::Reported) => self.reported += 1,
            Ok(ReconcileOutcome::Unavailable { .. } | ReconcileOutcome::Rejected { .. })
            | Err(_) => self.failed += 1,
            Ok(_) => self.skipped += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct StatusReconciler {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn StatusSink>,
    config: ReconcilerConfig,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn StatusSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Push one record's current status to the sink.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ContentKey) -> Result<ReconcileOutcome> {
        match self.store.get(key).await? {
            Some(record) => self.reconcile_record(&record).await,
            None => Ok(ReconcileOutcome::NotFound),
        }
    }

    /// Reconcile a set of content ids, as delivered by an external trigger.
    pub async fn reconcile_ids(&self, content_ids: &[String]) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for content_id in content_ids {
            let outcome = match self.store.get_by_content_id(content_id).await? {
                Some(record) => self.reconcile_record(&record).await,
                None => Ok(ReconcileOutcome::NotFound),
            };
            if let Err(e) = &outcome {
                warn!(content_id = %content_id, error = %e, "reconciliation failed");
            }
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Redrive stale ingestions, then push every unreported terminal record,
    /// chunk by chunk, until done or out of budget.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport {
            redriven: self.redrive_stale().await?,
            ..SweepReport::default()
        };

        let pending = self.store.scan(&ScanFilter::unreported()).await?;
        let total = pending.len();
        let mut chunks = pending.chunks(self.config.chunk_size).peekable();

        'chunks: while let Some(chunk) = chunks.next() {
            for record in chunk {
                // Always examine at least one record.
                if report.examined > 0 && started.elapsed() >= self.config.sweep_budget {
                    report.deferred = total - report.examined;
                    warn!(
                        deferred = report.deferred,
                        "sweep budget exhausted, leaving the rest for the next sweep"
                    );
                    break 'chunks;
                }
                let outcome = self.reconcile_record(record).await;
                if let Err(e) = &outcome {
                    warn!(content_id = %record.content_id, error = %e, "reconciliation failed");
                }
                report.record(&outcome);
            }

            if chunks.peek().is_none() {
                break;
            }
            tokio::time::sleep(self.config.chunk_delay).await;
        }

        info!(
            examined = report.examined,
            reported = report.reported,
            failed = report.failed,
            deferred = report.deferred,
            redriven = report.redriven,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep complete"
        );
        Ok(report)
    }

    /// Consume worker hand-offs until cancelled or every sender is gone.
    pub async fn run_handoff(&self, mut receiver: mpsc::Receiver<ContentKey>, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = receiver.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            if let Err(e) = self.reconcile(&key).await {
                warn!(key = %key, error = %e, "hand-off reconciliation failed, sweep will retry");
            }
        }
        debug!("hand-off loop stopped");
    }

    /// Run [`Self::sweep`] every `sweep_interval`, starting immediately.
    pub async fn run_sweeps(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "sweep failed");
            }
        }
        debug!("sweep loop stopped");
    }

    async fn reconcile_record(&self, record: &ContentRecord) -> Result<ReconcileOutcome> {
        if record.sheet_reported {
            return Ok(ReconcileOutcome::AlreadyReported);
        }
        let Some(update) = StatusUpdate::for_record(record, self.config.error_summary_len) else {
            return Ok(ReconcileOutcome::NotReady);
        };

        let sink = &self.sink;
        let update = &update;
        let attempts = match retry(&self.config.backoff, move |_| sink.report_status(update)).await {
            RetryOutcome::Succeeded { attempts, .. } => attempts,
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                let error = PipelineError::SinkUnavailable(last_error.to_string());
                warn!(content_id = %record.content_id, attempts, error = %error, "sink unavailable");
                return Ok(ReconcileOutcome::Unavailable {
                    attempts,
                    error: error.to_string(),
                });
            }
            RetryOutcome::Terminal { error, .. } => {
                warn!(content_id = %record.content_id, error = %error, "sink rejected status");
                return Ok(ReconcileOutcome::Rejected {
                    error: error.to_string(),
                });
            }
        };

        let condition = Condition::status_in([record.status]).with_sheet_reported(false);
        match self
            .store
            .conditional_update(&record.key(), &RecordUpdate::reported(Utc::now()), &condition)
            .await
        {
            Ok(_) => {
                debug!(content_id = %record.content_id, status = %record.status.as_str(), attempts, "status reported");
                Ok(ReconcileOutcome::Reported)
            }
            Err(PipelineError::ConditionFailed { message, .. }) => {
                debug!(content_id = %record.content_id, reason = %message, "record changed while reporting");
                Ok(ReconcileOutcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    async fn redrive_stale(&self) -> Result<usize> {
        let age = chrono::Duration::from_std(self.config.stale_ingest_after)
            .map_err(|e| PipelineError::config(format!("stale_ingest_after out of range: {e}")))?;
        let stale = self
            .store
            .scan(&ScanFilter::stale_ingested(Utc::now() - age))
            .await?;
        let count = stale.len();
        for record in stale {
            debug!(content_id = %record.content_id, "redriving stale ingestion");
            self.store.redrive(record);
        }
        if count > 0 {
            info!(count, "redrove stale ingestions");
        }
        Ok(count)
    }
}
