//! Submission queue abstraction with partial-batch-failure semantics.
//!
//! Consumers `receive` a batch, then `complete` the messages they handled and
//! `fail` the ones that should be redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use enrichflow_shared::{PipelineError, Result};

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
}

#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    /// Up to `max` messages, hidden from other consumers until completed or failed.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledge messages; they are never delivered again.
    async fn complete(&self, message_ids: &[String]) -> Result<()>;

    /// Return messages for redelivery.
    async fn fail(&self, message_ids: &[String]) -> Result<()>;

    /// Messages waiting or in flight.
    async fn pending(&self) -> Result<usize>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    dead_letters: Vec<QueueMessage>,
}

/// In-process queue. A message failed `max_receive_count` times moves to the
/// dead-letter list instead of being redelivered.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    max_receive_count: u32,
}

impl MemoryQueue {
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_receive_count: max_receive_count.max(1),
        }
    }

    /// Enqueue a message body; returns its id.
    pub fn send(&self, body: impl Into<String>) -> Result<String> {
        let message_id = Uuid::now_v7().to_string();
        self.lock()?.ready.push_back(QueueMessage {
            message_id: message_id.clone(),
            body: body.into(),
            receive_count: 0,
        });
        Ok(message_id)
    }

    /// Enqueue every non-blank line of a JSON-lines document.
    pub fn send_lines(&self, jsonl: &str) -> Result<usize> {
        let mut sent = 0;
        for line in jsonl.lines().filter(|l| !l.trim().is_empty()) {
            self.send(line)?;
            sent += 1;
        }
        Ok(sent)
    }

    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.lock()
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::TransientIo("queue lock poisoned".into()))
    }
}

#[async_trait]
impl SubmissionQueue for MemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut state = self.lock()?;
        let take = max.min(state.ready.len());
        let mut batch = Vec::with_capacity(take);
        for mut message in state.ready.drain(..take).collect::<Vec<_>>() {
            message.receive_count += 1;
            state
                .in_flight
                .insert(message.message_id.clone(), message.clone());
            batch.push(message);
        }
        Ok(batch)
    }

    async fn complete(&self, message_ids: &[String]) -> Result<()> {
        let mut state = self.lock()?;
        for id in message_ids {
            state.in_flight.remove(id);
        }
        Ok(())
    }

    async fn fail(&self, message_ids: &[String]) -> Result<()> {
        let mut state = self.lock()?;
        for id in message_ids {
            let Some(message) = state.in_flight.remove(id) else {
                continue;
            };
            if message.receive_count >= self.max_receive_count {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "message exceeded max receive count, dead-lettering"
                );
                state.dead_letters.push(message);
            } else {
                state.ready.push_back(message);
            }
        }
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.ready.len() + state.in_flight.len())
    }
}
