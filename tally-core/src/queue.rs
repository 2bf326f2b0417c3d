//! Serialized delivery queue
//!
//! A single tokio task owns the ordered list of pending events. Every
//! mutation (admitting an event, handling a delivery result, a backoff
//! timer firing) arrives as a [`Command`] on one channel and is applied to
//! completion before the next one is read, so no two mutations interleave.
//!
//! The task never does network I/O itself. Delivery attempts and backoff
//! timers run on their own spawned tasks and post their results back.
//!
//! ## Ordering
//!
//! Only the head of the list is ever dispatched, and it has to be delivered
//! before the queue advances. Events therefore reach the transport in
//! enqueue order, one at a time. A head that never succeeds blocks every
//! event behind it; this is the intended head-of-line behavior.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::context::ClientContext;
use crate::error::{Error, Result};
use crate::event::EventRecord;
use crate::retry::RetryScheduler;
use crate::store::EventStore;
use crate::transport::{DeliveryOutcome, Transport};

/// Default upper bound on one delivery attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval used by [`QueueHandle::drain`] to poll the queue
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Messages processed by the queue task
enum Command {
    Enqueue(EventRecord),
    Completed {
        attempt: u64,
        outcome: DeliveryOutcome,
    },
    RetryDue {
        attempt: u64,
    },
    Status(oneshot::Sender<QueueStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Coarse queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing pending, nothing in flight
    Idle,
    /// The head is in flight or waiting out a backoff delay
    Dispatching,
}

/// Snapshot of the queue, as seen by the queue task
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub state: QueueState,
    /// Events held in memory, including the head
    pub pending: usize,
    /// Whether a transport attempt is currently running
    pub in_flight: bool,
    /// Delay the next failure will be measured from
    pub current_delay: Duration,
    /// Transport attempts started since the queue was spawned
    pub attempts: u64,
    /// Events delivered since the queue was spawned
    pub delivered: u64,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.state == QueueState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InFlight,
    Backoff,
}

/// Spawns the queue task
pub struct DeliveryQueue {
    ctx: Arc<ClientContext>,
    store: Arc<dyn EventStore>,
    transport: Arc<dyn Transport>,
    retry: RetryScheduler,
    attempt_timeout: Duration,
}

impl DeliveryQueue {
    pub fn new(
        ctx: Arc<ClientContext>,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            ctx,
            store,
            transport,
            retry: RetryScheduler::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryScheduler) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Start the queue task. Must be called from within a Tokio runtime.
    ///
    /// The task first reloads every stored event, then resumes delivery
    /// from the oldest. It stops on [`QueueHandle::shutdown`] or once every
    /// handle has been dropped.
    pub fn spawn(self) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            ctx: self.ctx,
            store: self.store,
            transport: self.transport,
            retry: self.retry,
            attempt_timeout: self.attempt_timeout,
            pending: VecDeque::new(),
            phase: Phase::Idle,
            attempt: 0,
            attempts: 0,
            delivered: 0,
            tx: tx.downgrade(),
        };
        tokio::spawn(worker.run(rx));
        QueueHandle { tx }
    }
}

/// Cloneable producer handle to a running queue
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl QueueHandle {
    /// Admit an event. Returns immediately; delivery is asynchronous.
    pub fn enqueue(&self, record: EventRecord) {
        if self.tx.send(Command::Enqueue(record)).is_err() {
            tracing::warn!("Delivery queue is closed, dropping event");
        }
    }

    /// Current queue snapshot
    pub async fn status(&self) -> Result<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply))
            .map_err(|_| Error::QueueClosed)?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Wait until the queue is idle or `timeout` elapses, returning the
    /// last observed status.
    pub async fn drain(&self, timeout: Duration) -> Result<QueueStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if status.is_idle() || tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Stop the queue task. An attempt in flight is not aborted, but its
    /// result is discarded; undelivered events stay in the store.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .map_err(|_| Error::QueueClosed)?;
        rx.await.map_err(|_| Error::QueueClosed)
    }
}

struct Worker {
    ctx: Arc<ClientContext>,
    store: Arc<dyn EventStore>,
    transport: Arc<dyn Transport>,
    retry: RetryScheduler,
    attempt_timeout: Duration,
    pending: VecDeque<EventRecord>,
    phase: Phase,
    /// Token of the current head attempt; stale completions are ignored
    attempt: u64,
    attempts: u64,
    delivered: u64,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.restore();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Enqueue(record) => self.on_enqueue(record),
                Command::Completed { attempt, outcome } => self.on_completed(attempt, outcome),
                Command::RetryDue { attempt } => self.on_retry_due(attempt),
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown(reply) => {
                    tracing::info!(pending = self.pending.len(), "Delivery queue shutting down");
                    let _ = reply.send(());
                    return;
                }
            }
        }

        tracing::debug!(pending = self.pending.len(), "All queue handles dropped");
    }

    /// Reload events left over from a previous run.
    fn restore(&mut self) {
        match self.store.load_all(&self.ctx) {
            Ok(events) => {
                tracing::info!(count = events.len(), "Restored pending events");
                self.pending.extend(events);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load stored events, starting empty"),
        }
        self.dispatch_head();
    }

    fn on_enqueue(&mut self, mut record: EventRecord) {
        match self.store.append(&record) {
            Ok(id) => record.assign_id(id),
            Err(e) => tracing::warn!(
                event = record.name(),
                error = %e,
                "Failed to persist event, delivering from memory only"
            ),
        }

        tracing::debug!(event = record.name(), id = ?record.id(), "Event queued");
        let was_empty = self.pending.is_empty();
        self.pending.push_back(record);

        if was_empty {
            self.dispatch_head();
        }
    }

    fn on_completed(&mut self, attempt: u64, outcome: DeliveryOutcome) {
        if attempt != self.attempt || self.phase != Phase::InFlight {
            tracing::debug!(attempt, current = self.attempt, "Ignoring stale delivery result");
            return;
        }

        match outcome {
            DeliveryOutcome::Delivered => {
                if let Some(record) = self.pending.pop_front() {
                    if let Some(id) = record.id() {
                        if let Err(e) = self.store.remove(id) {
                            tracing::warn!(id, error = %e, "Failed to remove delivered event");
                        }
                    }
                    tracing::debug!(event = record.name(), id = ?record.id(), "Event delivered");
                }
                self.delivered += 1;
                self.retry.on_success();
                self.dispatch_head();
            }
            DeliveryOutcome::Failed(reason) => {
                let delay = self.retry.on_failure();
                tracing::warn!(
                    event = self.pending.front().map(EventRecord::name),
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Delivery failed, retrying head"
                );
                self.phase = Phase::Backoff;
                self.schedule_retry(attempt, delay);
            }
        }
    }

    fn on_retry_due(&mut self, attempt: u64) {
        if attempt == self.attempt && self.phase == Phase::Backoff {
            self.dispatch_head();
        }
    }

    fn dispatch_head(&mut self) {
        let Some(head) = self.pending.front() else {
            self.phase = Phase::Idle;
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            self.phase = Phase::Idle;
            return;
        };

        self.attempt += 1;
        self.attempts += 1;
        self.phase = Phase::InFlight;

        let attempt = self.attempt;
        let record = head.clone();
        let transport = Arc::clone(&self.transport);
        let timeout = self.attempt_timeout;

        tracing::debug!(event = record.name(), id = ?record.id(), attempt, "Dispatching head");
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, transport.send(&record)).await {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Failed(format!("attempt timed out after {:?}", timeout)),
            };
            let _ = tx.send(Command::Completed { attempt, outcome });
        });
    }

    fn schedule_retry(&self, attempt: u64, delay: Duration) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::RetryDue { attempt });
        });
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            state: if self.phase == Phase::Idle {
                QueueState::Idle
            } else {
                QueueState::Dispatching
            },
            pending: self.pending.len(),
            in_flight: self.phase == Phase::InFlight,
            current_delay: self.retry.current(),
            attempts: self.attempts,
            delivered: self.delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SdkKey;
    use crate::event::Params;
    use crate::store::SqliteStore;
    use crate::transport::SendFuture;

    struct AlwaysDelivered;

    impl Transport for AlwaysDelivered {
        fn send<'a>(&'a self, _record: &'a EventRecord) -> SendFuture<'a> {
            Box::pin(async { DeliveryOutcome::Delivered })
        }
    }

    struct NeverAnswers;

    impl Transport for NeverAnswers {
        fn send<'a>(&'a self, _record: &'a EventRecord) -> SendFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn context() -> Arc<ClientContext> {
        let key = SdkKey::parse("pubKprivK").unwrap();
        Arc::new(ClientContext::new(&key, "UU1", "HU1", "com.example", "1.0"))
    }

    fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store.run_migrations().unwrap();
        Arc::new(store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_idle_with_empty_store() {
        let queue = DeliveryQueue::new(context(), store(), Arc::new(AlwaysDelivered)).spawn();
        let status = queue.status().await.unwrap();
        assert!(status.is_idle());
        assert_eq!(status.pending, 0);
        assert_eq!(status.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_delivered_and_removed() {
        let ctx = context();
        let store = store();
        let queue =
            DeliveryQueue::new(ctx.clone(), store.clone(), Arc::new(AlwaysDelivered)).spawn();

        queue.enqueue(EventRecord::create("Launch", Params::new(), None, &ctx).unwrap());
        let status = queue.drain(Duration::from_secs(5)).await.unwrap();

        assert!(status.is_idle());
        assert_eq!(status.delivered, 1);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out_and_backs_off() {
        let ctx = context();
        let queue = DeliveryQueue::new(ctx.clone(), store(), Arc::new(NeverAnswers))
            .with_attempt_timeout(Duration::from_secs(1))
            .spawn();

        queue.enqueue(EventRecord::create("Stuck", Params::new(), None, &ctx).unwrap());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let status = queue.status().await.unwrap();
        assert_eq!(status.state, QueueState::Dispatching);
        assert!(!status.in_flight);
        assert_eq!(status.current_delay, Duration::from_secs(2));
        assert_eq!(status.pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_handle() {
        let queue = DeliveryQueue::new(context(), store(), Arc::new(AlwaysDelivered)).spawn();
        queue.shutdown().await.unwrap();
        tokio::task::yield_now().await;
        assert!(matches!(queue.status().await, Err(Error::QueueClosed)));
    }
}
