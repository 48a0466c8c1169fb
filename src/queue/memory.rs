//! In-memory peek-lock queue with broadcast events.
//!
//! Backs tests and the binary's local mode. Redelivery follows broker
//! semantics: an abandoned message goes back to the tail of the queue with
//! its delivery count incremented on the next receive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeadLetterReason, QueueClient};
use crate::error::QueueError;
use crate::pipeline::types::InboundMessage;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Observable queue activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued { message_id: String },
    Received { message_id: String, delivery_count: u32 },
    Completed { message_id: String },
    Abandoned { message_id: String, delivery_count: u32 },
    DeadLettered { message_id: String, reason: String },
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub id: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: String,
    pub description: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    /// Deliveries made so far.
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, StoredMessage>,
    completed: Vec<String>,
    dead_letters: Vec<DeadLetteredMessage>,
}

/// In-memory queue.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    available: Notify,
    tx: broadcast::Sender<QueueEvent>,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            tx,
        })
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Enqueue a message body. Returns the assigned message ID.
    pub async fn send(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.send_with_id(id.clone(), body).await;
        id
    }

    /// Enqueue a message body under a caller-chosen ID.
    pub async fn send_with_id(&self, id: impl Into<String>, body: impl Into<String>) {
        let message = StoredMessage {
            id: id.into(),
            body: body.into(),
            delivery_count: 0,
            enqueued_at: Utc::now(),
        };
        debug!(message_id = %message.id, "Message enqueued");
        let event = QueueEvent::Enqueued {
            message_id: message.id.clone(),
        };
        self.state.lock().await.ready.push_back(message);
        self.available.notify_one();
        let _ = self.tx.send(event);
    }

    /// Messages waiting for delivery.
    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages currently locked by a receiver.
    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// IDs of completed messages, in completion order.
    pub async fn completed(&self) -> Vec<String> {
        self.state.lock().await.completed.clone()
    }

    /// Dead-lettered messages, in order.
    pub async fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Take the lock held by `message`, or fail with `LockLost`.
    async fn release_lock(&self, message: &InboundMessage) -> Result<StoredMessage, QueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&message.lock_token)
            .ok_or_else(|| {
                warn!(message_id = %message.id, "Settlement attempted without a valid lock");
                QueueError::LockLost {
                    message_id: message.id.clone(),
                }
            })
    }

    /// Pop up to `max` ready messages and lock them.
    async fn take_ready(&self, max: usize) -> Vec<InboundMessage> {
        let mut state = self.state.lock().await;
        let count = max.min(state.ready.len());
        let mut batch = Vec::with_capacity(count);

        for mut stored in state.ready.drain(..count).collect::<Vec<_>>() {
            stored.delivery_count += 1;
            let lock_token = Uuid::new_v4();
            batch.push(InboundMessage {
                id: stored.id.clone(),
                delivery_count: stored.delivery_count,
                lock_token,
                body: stored.body.clone(),
                enqueued_at: stored.enqueued_at,
            });
            state.in_flight.insert(lock_token, stored);
        }

        for message in &batch {
            let _ = self.tx.send(QueueEvent::Received {
                message_id: message.id.clone(),
                delivery_count: message.delivery_count,
            });
        }
        batch
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<InboundMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.take_ready(max_messages).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            // A stored permit may wake us spuriously; the loop re-checks.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), QueueError> {
        let stored = self.release_lock(message).await?;
        self.state.lock().await.completed.push(stored.id.clone());
        let _ = self.tx.send(QueueEvent::Completed {
            message_id: stored.id,
        });
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), QueueError> {
        let stored = self.release_lock(message).await?;
        let event = QueueEvent::Abandoned {
            message_id: stored.id.clone(),
            delivery_count: stored.delivery_count,
        };
        self.state.lock().await.ready.push_back(stored);
        self.available.notify_one();
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError> {
        let stored = self.release_lock(message).await?;
        let event = QueueEvent::DeadLettered {
            message_id: stored.id.clone(),
            reason: reason.reason.clone(),
        };
        self.state
            .lock()
            .await
            .dead_letters
            .push(DeadLetteredMessage {
                id: stored.id,
                body: stored.body,
                delivery_count: stored.delivery_count,
                reason: reason.reason.clone(),
                description: reason.description.clone(),
            });
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Enqueue every non-blank line from `reader` as a message body.
///
/// Returns the number of messages enqueued once the reader is exhausted.
pub async fn feed_lines<R>(queue: &InMemoryQueue, reader: R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        queue.send(line).await;
        count += 1;
    }
    info!(count, "Input closed");
    Ok(count)
}
