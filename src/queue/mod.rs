//! Queue client abstraction.
//!
//! The consumer only sees [`QueueClient`]: peek-lock receive plus the three
//! settlements. A message is settled exactly once; settling with a lock that
//! is no longer held fails with `QueueError::LockLost`.

pub mod memory;

pub use memory::{DeadLetteredMessage, InMemoryQueue, QueueEvent, feed_lines};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::pipeline::types::InboundMessage;

/// Reason attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterReason {
    /// Error kind, e.g. `ValidationError`.
    pub reason: String,
    /// Human-readable detail.
    pub description: String,
}

impl DeadLetterReason {
    pub fn new(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            description: description.into(),
        }
    }
}

/// A peek-lock queue.
///
/// `receive` must be cancel-safe: dropping its future before it resolves
/// loses no message.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `max_wait` for the first.
    /// Returns an empty batch when nothing arrived in time.
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<InboundMessage>, QueueError>;

    /// Remove the message from the queue.
    async fn complete(&self, message: &InboundMessage) -> Result<(), QueueError>;

    /// Release the lock so the message is redelivered.
    async fn abandon(&self, message: &InboundMessage) -> Result<(), QueueError>;

    /// Move the message to the dead-letter queue.
    async fn dead_letter(
        &self,
        message: &InboundMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError>;
}
