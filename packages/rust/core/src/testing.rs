//! Scripted fakes shared by the core test modules.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use enrichflow_clients::{
    EnrichmentClient, GeneratedContent, GenerationRequest, SinkAck, StatusSink,
};
use enrichflow_shared::{ContentKey, ContentRecord, PipelineError, Result, StatusUpdate, TagSet};
use enrichflow_storage::{
    ChangeEvent, Condition, MemoryStore, RecordStore, RecordUpdate, ScanFilter, UpsertOutcome,
};

pub fn generated() -> GeneratedContent {
    GeneratedContent {
        title: "Shipping A Data Pipeline".into(),
        description: Some("A short look at shipping a new pipeline with Airflow.".into()),
        tags: TagSet::from_csv("data,airflow,etl"),
    }
}

// ---------------------------------------------------------------------------
// Enrichment client
// ---------------------------------------------------------------------------

type Reply<T> = fn() -> Result<T>;

/// Answers from a script, then from `fallback` once the script runs out.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<GeneratedContent>>>,
    fallback: Reply<GeneratedContent>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn succeeding() -> Self {
        Self::with_fallback(|| Ok(generated()))
    }

    pub fn with_fallback(fallback: Reply<GeneratedContent>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Never answers within any reasonable timeout.
    pub fn hanging() -> Self {
        let mut client = Self::succeeding();
        client.delay = Some(Duration::from_secs(30));
        client
    }

    pub fn then(self, reply: Result<GeneratedContent>) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentClient for ScriptedClient {
    async fn generate(
        &self,
        _request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<GeneratedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().expect("script lock").pop_front();
        scripted.unwrap_or_else(self.fallback)
    }
}

/// Stores `replacement` during its first call, as a submitter re-sending
/// edited content would, and titles every reply after the description it
/// was asked about.
pub struct ResubmittingClient {
    store: Arc<dyn RecordStore>,
    replacement: Mutex<Option<ContentRecord>>,
    calls: AtomicU32,
}

impl ResubmittingClient {
    pub fn new(store: Arc<dyn RecordStore>, replacement: ContentRecord) -> Self {
        Self {
            store,
            replacement: Mutex::new(Some(replacement)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentClient for ResubmittingClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<GeneratedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let replacement = self.replacement.lock().expect("replacement lock").take();
        if let Some(record) = replacement {
            self.store.upsert(record).await?;
        }
        let description = request.description.clone().unwrap_or_default();
        Ok(GeneratedContent {
            title: format!("Title for {description}"),
            description: None,
            tags: TagSet::from_csv("data,airflow,etl"),
        })
    }
}

// ---------------------------------------------------------------------------
// Status sink
// ---------------------------------------------------------------------------

pub struct ScriptedSink {
    script: Mutex<VecDeque<Result<SinkAck>>>,
    fallback: Reply<SinkAck>,
    received: Mutex<Vec<StatusUpdate>>,
}

impl ScriptedSink {
    pub fn accepting() -> Self {
        Self::with_fallback(|| Ok(SinkAck { message: None }))
    }

    pub fn unavailable() -> Self {
        Self::with_fallback(|| Err(PipelineError::SinkUnavailable("503 from sink".into())))
    }

    pub fn with_fallback(fallback: Reply<SinkAck>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: Result<SinkAck>) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(reply);
        self
    }

    pub fn received(&self) -> Vec<StatusUpdate> {
        self.received.lock().expect("received lock").clone()
    }
}

#[async_trait]
impl StatusSink for ScriptedSink {
    async fn report_status(&self, update: &StatusUpdate) -> Result<SinkAck> {
        self.received
            .lock()
            .expect("received lock")
            .push(update.clone());
        let scripted = self.script.lock().expect("script lock").pop_front();
        scripted.unwrap_or_else(self.fallback)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// [`MemoryStore`] whose writes fail with `StoreWrite` while `failing` is set.
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::wrapping(MemoryStore::new())
    }

    pub fn wrapping(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PipelineError::StoreWrite("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn upsert(&self, record: ContentRecord) -> Result<UpsertOutcome> {
        self.check()?;
        self.inner.upsert(record).await
    }

    async fn get(&self, key: &ContentKey) -> Result<Option<ContentRecord>> {
        self.inner.get(key).await
    }

    async fn get_by_content_id(&self, content_id: &str) -> Result<Option<ContentRecord>> {
        self.inner.get_by_content_id(content_id).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ContentRecord>> {
        self.inner.scan(filter).await
    }

    async fn conditional_update(
        &self,
        key: &ContentKey,
        update: &RecordUpdate,
        condition: &Condition,
    ) -> Result<ContentRecord> {
        self.check()?;
        self.inner.conditional_update(key, update, condition).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }

    fn redrive(&self, record: ContentRecord) {
        self.inner.redrive(record)
    }
}
