//! In-process [`RecordStore`] backed by a map.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use enrichflow_shared::{ContentKey, ContentRecord, PipelineError, Result};
use tokio::sync::broadcast;

use crate::DEFAULT_CHANGE_FEED_CAPACITY;
use crate::model::{
    ChangeEvent, Condition, RecordStore, RecordUpdate, ScanFilter, UpsertKind, UpsertOutcome,
    condition_failed, plan_upsert,
};

/// Map-backed store with the same upsert, condition and change-feed semantics
/// as the libSQL backend.
pub struct MemoryStore {
    records: Mutex<HashMap<ContentKey, ContentRecord>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_FEED_CAPACITY)
    }

    /// `capacity` bounds the change feed before subscribers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ContentKey, ContentRecord>>> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Storage("memory store lock poisoned".into()))
    }

    fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: ContentRecord) -> Result<UpsertOutcome> {
        let outcome = {
            let mut records = self.lock()?;
            let key = record.key();
            let outcome = plan_upsert(records.get(&key).cloned(), record);
            if outcome.kind != UpsertKind::Unchanged {
                records.insert(key, outcome.record.clone());
            }
            outcome
        };

        match outcome.kind {
            UpsertKind::Inserted => self.publish(ChangeEvent::insert(outcome.record.clone())),
            UpsertKind::Updated => self.publish(ChangeEvent::modify(outcome.record.clone())),
            UpsertKind::Unchanged => {}
        }
        Ok(outcome)
    }

    async fn get(&self, key: &ContentKey) -> Result<Option<ContentRecord>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn get_by_content_id(&self, content_id: &str) -> Result<Option<ContentRecord>> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.content_id == content_id)
            .min_by_key(|r| r.ingested_at)
            .cloned())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ContentRecord>> {
        let mut matched: Vec<ContentRecord> = self
            .lock()?
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.ingested_at
                .cmp(&b.ingested_at)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn conditional_update(
        &self,
        key: &ContentKey,
        update: &RecordUpdate,
        condition: &Condition,
    ) -> Result<ContentRecord> {
        let updated = {
            let mut records = self.lock()?;
            let record = records
                .get_mut(key)
                .ok_or_else(|| condition_failed(key, "record not found"))?;
            if !condition.holds(record, update) {
                return Err(condition_failed(
                    key,
                    format!("condition not met (status {})", record.status),
                ));
            }
            update.apply(record);
            record.clone()
        };

        self.publish(ChangeEvent::modify(updated.clone()));
        Ok(updated)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn redrive(&self, record: ContentRecord) {
        self.publish(ChangeEvent::modify(record));
    }
}
