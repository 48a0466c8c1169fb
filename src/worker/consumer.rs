//! Queue consumer: bounded-concurrency dispatch with graceful shutdown.
//!
//! Handles:
//! - Batched receives, never more than the free worker capacity
//! - One spawned unit per message, bounded by a semaphore
//! - Disposition of every message: complete, abandon or dead-letter
//! - Drain on stop, then cancellation of whatever is still running

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ProcessingError, QueueError};
use crate::pipeline::types::{InboundMessage, MessageHandler, ProcessingOutcome};
use crate::queue::{DeadLetterReason, QueueClient};
use crate::worker::state::{ConsumerState, StopRequest};

/// Time cancelled units get to abandon their message before being aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed receive.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Maximum messages processed at once.
    pub max_concurrency: usize,
    /// How long in-flight work may run after a stop.
    pub shutdown_timeout: Duration,
    /// Deliveries allowed before a retryable failure is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Upper bound on messages pulled per receive.
    pub receive_batch_size: usize,
    /// How long one receive waits for messages.
    pub receive_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            shutdown_timeout: Duration::from_secs(30),
            max_delivery_attempts: 3,
            receive_batch_size: 10,
            receive_wait: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("MAX_CONCURRENCY", self.max_concurrency as u64),
            ("MAX_DELIVERY_ATTEMPTS", u64::from(self.max_delivery_attempts)),
            ("receive_batch_size", self.receive_batch_size as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.receive_batch_size.min(self.max_concurrency)
    }
}

// ── Stats ───────────────────────────────────────────────────────────

/// Live counters, updated by the consumer and its units.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
}

impl ConsumerStats {
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            received: self.received.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight(),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

/// Decrements the in-flight counter when a unit ends, even if aborted.
struct InFlightGuard(Arc<ConsumerStats>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    /// Units cancelled at shutdown; their messages are among `abandoned`.
    pub cancelled: u64,
    pub peak_in_flight: u64,
}

// ── Disposition ─────────────────────────────────────────────────────

/// Terminal action taken on a processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    Abandon,
    DeadLetter(DeadLetterReason),
}

/// Decide what happens to a message given its outcome.
pub fn disposition(
    outcome: &ProcessingOutcome,
    delivery_count: u32,
    max_delivery_attempts: u32,
) -> Disposition {
    match outcome {
        ProcessingOutcome::Success(_) => Disposition::Complete,
        ProcessingOutcome::Retryable(ProcessingError::ShutdownTimeout(_)) => Disposition::Abandon,
        ProcessingOutcome::Retryable(_) if delivery_count < max_delivery_attempts => {
            Disposition::Abandon
        }
        ProcessingOutcome::Retryable(e) => Disposition::DeadLetter(DeadLetterReason::new(
            e.kind(),
            format!("{e} (after {delivery_count} delivery attempts)"),
        )),
        ProcessingOutcome::Fatal(e) => {
            Disposition::DeadLetter(DeadLetterReason::new(e.kind(), e.to_string()))
        }
    }
}

// ── Shutdown ────────────────────────────────────────────────────────

/// Cloneable handle to stop a running consumer.
///
/// The first stop drains; a second stop cancels in-flight work at once.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop_tx: Arc<watch::Sender<StopRequest>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.stop_tx.send_if_modified(|request| {
            let next = request.escalate();
            if next == *request {
                return false;
            }
            match next {
                StopRequest::Graceful => info!("Stop requested, draining"),
                StopRequest::Immediate => warn!("Second stop requested, cancelling in-flight work"),
                StopRequest::None => {}
            }
            *request = next;
            true
        });
    }

    pub fn requested(&self) -> StopRequest {
        *self.stop_tx.borrow()
    }
}

/// Resolve once cancellation is signalled. Never resolves otherwise.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ── Consumer ────────────────────────────────────────────────────────

/// Pulls messages from a queue and processes them concurrently.
pub struct Consumer {
    queue: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    state_tx: watch::Sender<ConsumerState>,
    stop_tx: Arc<watch::Sender<StopRequest>>,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConsumerState::Running);
        let (stop_tx, _) = watch::channel(StopRequest::None);
        Ok(Self {
            queue,
            handler,
            config,
            stats: Arc::new(ConsumerStats::default()),
            state_tx,
            stop_tx: Arc::new(stop_tx),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    fn transition(&self, to: ConsumerState) {
        self.state_tx.send_if_modified(|state| {
            if !state.can_transition_to(to) {
                return false;
            }
            info!(from = %state, to = %to, "Consumer state changed");
            *state = to;
            true
        });
    }

    /// Run until stopped. Returns once every received message has a
    /// disposition (or its unit was aborted after the cancel grace period).
    pub async fn start(self) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut units: JoinSet<()> = JoinSet::new();
        let mut stop_rx = self.stop_tx.subscribe();

        info!(
            max_concurrency = self.config.max_concurrency,
            batch_size = self.config.batch_size(),
            max_delivery_attempts = self.config.max_delivery_attempts,
            "Consumer started"
        );

        'receive: loop {
            if *stop_rx.borrow_and_update() != StopRequest::None {
                break;
            }
            while let Some(joined) = units.try_join_next() {
                log_join_error(joined);
            }

            let received = tokio::select! {
                biased;
                Ok(()) = stop_rx.changed() => continue,
                received = self.queue.receive(self.config.batch_size(), self.config.receive_wait) => received,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(QueueError::Closed) => {
                    info!("Queue closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    tokio::select! {
                        Ok(()) = stop_rx.changed() => {}
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            let mut batch = batch.into_iter();
            while let Some(message) = batch.next() {
                self.stats.received.fetch_add(1, Ordering::SeqCst);

                let permit = tokio::select! {
                    biased;
                    Ok(()) = stop_rx.changed() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    let undispatched: Vec<InboundMessage> =
                        std::iter::once(message).chain(batch).collect();
                    self.stats
                        .received
                        .fetch_add(undispatched.len() as u64 - 1, Ordering::SeqCst);
                    self.abandon_undispatched(undispatched).await;
                    break 'receive;
                };

                debug!(
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    "Dispatching message"
                );
                let unit = Unit {
                    queue: self.queue.clone(),
                    handler: self.handler.clone(),
                    stats: self.stats.clone(),
                    max_delivery_attempts: self.config.max_delivery_attempts,
                    shutdown_timeout: self.config.shutdown_timeout,
                };
                let cancel = cancel_rx.clone();
                units.spawn(async move {
                    let _permit = permit;
                    unit.run(message, cancel).await;
                });
            }
        }

        self.transition(ConsumerState::Draining);
        self.drain(&mut units, &mut stop_rx, &cancel_tx).await;
        self.transition(ConsumerState::Stopped);

        let summary = self.stats.snapshot();
        info!(
            received = summary.received,
            completed = summary.completed,
            abandoned = summary.abandoned,
            dead_lettered = summary.dead_lettered,
            cancelled = summary.cancelled,
            peak_in_flight = summary.peak_in_flight,
            "Consumer stopped"
        );
        summary
    }

    /// Abandon messages received but never dispatched.
    async fn abandon_undispatched(&self, messages: Vec<InboundMessage>) {
        if messages.is_empty() {
            return;
        }
        info!(count = messages.len(), "Abandoning undispatched messages");
        for message in messages {
            match self.queue.abandon(&message).await {
                Ok(()) => {
                    self.stats.abandoned.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => error!(message_id = %message.id, error = %e, "Abandon failed"),
            }
        }
    }

    /// Wait for in-flight units, cancelling them once the shutdown timeout
    /// elapses or a second stop arrives.
    async fn drain(
        &self,
        units: &mut JoinSet<()>,
        stop_rx: &mut watch::Receiver<StopRequest>,
        cancel_tx: &watch::Sender<bool>,
    ) {
        let immediate = *stop_rx.borrow_and_update() == StopRequest::Immediate;
        let deadline = tokio::time::Instant::now()
            + if immediate {
                Duration::ZERO
            } else {
                self.config.shutdown_timeout
            };

        debug!(in_flight = units.len(), "Draining in-flight work");
        while !units.is_empty() {
            tokio::select! {
                biased;
                Some(joined) = units.join_next() => log_join_error(joined),
                Ok(()) = stop_rx.changed() => {
                    if *stop_rx.borrow_and_update() == StopRequest::Immediate {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        if units.is_empty() {
            return;
        }

        warn!(
            remaining = units.len(),
            timeout = ?self.config.shutdown_timeout,
            "Cancelling in-flight work"
        );
        let _ = cancel_tx.send(true);

        let grace = tokio::time::sleep(CANCEL_GRACE);
        tokio::pin!(grace);
        while !units.is_empty() {
            tokio::select! {
                Some(joined) = units.join_next() => log_join_error(joined),
                _ = &mut grace => {
                    error!(remaining = units.len(), "Units ignored cancellation, aborting");
                    units.abort_all();
                    while units.join_next().await.is_some() {}
                }
            }
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Processing unit panicked");
        }
    }
}

/// Everything one spawned unit needs.
struct Unit {
    queue: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<ConsumerStats>,
    max_delivery_attempts: u32,
    shutdown_timeout: Duration,
}

impl Unit {
    async fn run(self, message: InboundMessage, cancel: watch::Receiver<bool>) {
        let _in_flight = self.stats.enter();

        let outcome = tokio::select! {
            outcome = self.handler.handle(&message) => outcome,
            _ = cancelled(cancel) => {
                warn!(
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    "Shutdown timeout elapsed, abandoning in-flight message"
                );
                self.stats.cancelled.fetch_add(1, Ordering::SeqCst);
                ProcessingOutcome::Retryable(ProcessingError::ShutdownTimeout(self.shutdown_timeout))
            }
        };

        self.settle(&message, &outcome).await;
    }

    async fn settle(&self, message: &InboundMessage, outcome: &ProcessingOutcome) {
        let decision = disposition(outcome, message.delivery_count, self.max_delivery_attempts);
        match decision {
            Disposition::Complete => match self.queue.complete(message).await {
                Ok(()) => {
                    self.stats.completed.fetch_add(1, Ordering::SeqCst);
                    debug!(message_id = %message.id, outcome = outcome.label(), "Message completed");
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Complete failed, abandoning");
                    self.abandon(message).await;
                }
            },
            Disposition::Abandon => {
                info!(
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    outcome = outcome.label(),
                    "Abandoning message for redelivery"
                );
                self.abandon(message).await;
            }
            Disposition::DeadLetter(reason) => {
                match self.queue.dead_letter(message, &reason).await {
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            message_id = %message.id,
                            delivery_count = message.delivery_count,
                            reason = %reason.reason,
                            description = %reason.description,
                            "Message dead-lettered"
                        );
                    }
                    Err(e) => {
                        error!(message_id = %message.id, error = %e, "Dead-letter failed, abandoning");
                        self.abandon(message).await;
                    }
                }
            }
        }
    }

    async fn abandon(&self, message: &InboundMessage) {
        match self.queue.abandon(message).await {
            Ok(()) => {
                self.stats.abandoned.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => error!(message_id = %message.id, error = %e, "Abandon failed"),
        }
    }
}
