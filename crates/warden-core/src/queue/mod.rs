//! Priority message queue: persistent, TTL-bounded, priority-ordered
//! delivery with retry and acknowledgment semantics.
//!
//! The dispatcher is a single cooperative loop ("cooperative event
//! loop" note): external callers enqueue through `MessageQueue`'s own
//! methods, which serialize access via an internal mutex, and the
//! dispatcher task is the only thing that pops messages off the per-priority
//! FIFOs and invokes handlers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ErrorKind, TaxonomyError};
use crate::message::{EnqueueOptions, Message, MessageStatus, Priority};
use warden_store::queue_state::{self, QueueMetricsSnapshot, QueueStateFile};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full (max {max})")]
    QueueFull { max: usize },
    #[error("message {0} not found")]
    NotFound(Uuid),
    #[error("message {0} is not awaiting acknowledgment")]
    NotAwaitingAck(Uuid),
}

impl TaxonomyError for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            QueueError::QueueFull { .. } => ErrorKind::ResourceExhausted,
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::NotAwaitingAck(_) => ErrorKind::Fatal,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(Message),
    Delivered { message: Message, duration_ms: u64 },
    Failed { message: Message, error: String },
    Expired(Message),
    Acknowledged { message_id: Uuid, success: bool },
    Dropped(Message),
}

impl QueueEvent {
    pub fn message_id(&self) -> Uuid {
        match self {
            QueueEvent::Enqueued(m)
            | QueueEvent::Delivered { message: m, .. }
            | QueueEvent::Failed { message: m, .. }
            | QueueEvent::Expired(m)
            | QueueEvent::Dropped(m) => m.id,
            QueueEvent::Acknowledged { message_id, .. } => *message_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub persistence_path: Option<PathBuf>,
    pub cleanup_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            persistence_path: None,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct PendingAck {
    message: Message,
    deadline: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    // BTreeMap over Priority keeps iteration in ascending key order; we walk
    // it in reverse to get Critical-first.
    priority_queues: BTreeMap<Priority, VecDeque<Message>>,
    pending_ack: HashMap<Uuid, PendingAck>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    processed_ids: HashSet<Uuid>,
    cancelled_ids: HashSet<Uuid>,
    metrics: QueueMetricsSnapshot,
}

impl Inner {
    fn new() -> Self {
        Self {
            priority_queues: BTreeMap::new(),
            pending_ack: HashMap::new(),
            handlers: HashMap::new(),
            processed_ids: HashSet::new(),
            cancelled_ids: HashSet::new(),
            metrics: QueueMetricsSnapshot::default(),
        }
    }

    fn depth(&self) -> usize {
        self.priority_queues.values().map(|q| q.len()).sum()
    }

    fn to_file(&self) -> QueueStateFile {
        let mut messages: Vec<Message> = self
            .priority_queues
            .values()
            .flat_map(|q| q.iter().cloned())
            .collect();
        messages.extend(self.pending_ack.values().map(|p| p.message.clone()));

        QueueStateFile {
            schema_version: warden_store::queue_state::SCHEMA_VERSION,
            messages,
            processed_ids: self.processed_ids.iter().copied().collect(),
            metrics: self.metrics.clone(),
        }
    }

    fn push(&mut self, message: Message) {
        self.priority_queues
            .entry(message.priority)
            .or_default()
            .push_back(message);
    }
}

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

pub struct MessageQueue {
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl MessageQueue {
    pub fn new(clock: Arc<dyn Clock>, config: QueueConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        let queue = Arc::new(Self {
            clock,
            config,
            inner: Mutex::new(Inner::new()),
            notify: Notify::new(),
            events,
        });

        if let Some(path) = queue.config.persistence_path.clone() {
            if let Ok(state) = queue_state::load(&path) {
                let now = queue.clock.now();
                let mut inner = queue.inner.try_lock().expect("fresh queue is uncontended");
                for message in state.messages {
                    if !message.is_expired(now) {
                        match message.status {
                            MessageStatus::Delivered if message.delivery_options.require_ack => {
                                inner.pending_ack.insert(
                                    message.id,
                                    PendingAck {
                                        deadline: message.metadata.created_at
                                            + chrono::Duration::milliseconds(
                                                message.delivery_options.timeout_ms as i64,
                                            ),
                                        message,
                                    },
                                );
                            }
                            _ => inner.push(message),
                        }
                    }
                }
                inner.processed_ids = state.processed_ids.into_iter().collect();
                inner.metrics = state.metrics;
            }
        }

        queue
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.config.persistence_path else {
            return;
        };
        if let Err(e) = queue_state::save(path, &inner.to_file()) {
            // Persistence is best-effort: failures are logged, never
            // propagated back to the caller of the mutating operation.
            warn!(error = %e, "failed to persist queue state");
        }
    }

    // -- public API ---------------------------------------------------

    pub async fn enqueue(&self, options: EnqueueOptions) -> Result<Message, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if inner.depth() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull {
                max: self.config.max_queue_size,
            });
        }

        let message = Message {
            id: Uuid::new_v4(),
            message_type: options.message_type,
            priority: options.priority,
            status: MessageStatus::Pending,
            sender: options.sender,
            receiver: options.receiver,
            content: options.content,
            metadata: warden_store::models::MessageMetadata::new(now),
            delivery_options: options.delivery_options,
            plan_id: options.plan_id,
            task_id: options.task_id,
            subtask_id: options.subtask_id,
            depth: options.depth,
        };

        inner.push(message.clone());
        inner.metrics.total_enqueued += 1;
        self.persist(&inner);
        drop(inner);

        debug!(message_id = %message.id, priority = ?message.priority, "enqueued message");
        self.emit(QueueEvent::Enqueued(message.clone()));
        self.notify.notify_one();

        Ok(message)
    }

    pub async fn register_handler(&self, agent_id: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let agent_id = agent_id.into();
        let mut inner = self.inner.lock().await;
        inner.handlers.insert(agent_id, handler);
        drop(inner);
        // Registration rescans the queue for messages already addressed to
        // this agent.
        self.notify.notify_one();
    }

    pub async fn unregister_handler(&self, agent_id: &str) {
        self.inner.lock().await.handlers.remove(agent_id);
    }

    pub async fn acknowledge(
        &self,
        message_id: Uuid,
        success: bool,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mut pending = inner
            .pending_ack
            .remove(&message_id)
            .ok_or(QueueError::NotAwaitingAck(message_id))?;

        pending.message.status = if success {
            MessageStatus::Acknowledged
        } else {
            MessageStatus::Failed
        };
        pending.message.metadata.acknowledged_at = Some(self.clock.now());
        pending.message.metadata.last_error = error;
        inner.processed_ids.insert(message_id);
        self.persist(&inner);
        drop(inner);

        self.emit(QueueEvent::Acknowledged {
            message_id,
            success,
        });
        Ok(())
    }

    /// Remove a message from the queue or the pending-ack map. Idempotent:
    /// the first call for a given id returns `true`, every subsequent call
    /// returns `false`.
    pub async fn cancel_message(&self, message_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.cancelled_ids.contains(&message_id) {
            return false;
        }

        let mut removed = inner.pending_ack.remove(&message_id).is_some();
        if !removed {
            for queue in inner.priority_queues.values_mut() {
                if let Some(pos) = queue.iter().position(|m| m.id == message_id) {
                    queue.remove(pos);
                    removed = true;
                    break;
                }
            }
        }

        inner.cancelled_ids.insert(message_id);
        self.persist(&inner);
        removed
    }

    pub async fn get_metrics(&self) -> QueueMetricsSnapshot {
        self.inner.lock().await.metrics.clone()
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.depth()
    }

    pub async fn depth_by_priority(&self, priority: Priority) -> usize {
        self.inner
            .lock()
            .await
            .priority_queues
            .get(&priority)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::new();
        self.persist(&inner);
    }

    // -- dispatcher -----------------------------------------------------

    /// Run one pass of the dispatch algorithm, delivering every message
    /// currently eligible for delivery. Exposed separately from [`Self::run`]
    /// so tests can step the dispatcher deterministically.
    pub async fn dispatch_once(self: &Arc<Self>) {
        loop {
            let Some((message, handler)) = self.next_ready().await else {
                break;
            };
            self.deliver(message, handler).await;
        }
    }

    async fn next_ready(self: &Arc<Self>) -> Option<(Message, Arc<dyn MessageHandler>)> {
        loop {
            let now = self.clock.now();
            let mut inner = self.inner.lock().await;

            // Walk priorities Critical -> Low (BTreeMap keys ascend, so
            // reverse).
            let priorities: Vec<Priority> = inner.priority_queues.keys().copied().rev().collect();

            for priority in priorities {
                let Some(queue) = inner.priority_queues.get_mut(&priority) else {
                    continue;
                };
                let Some(front) = queue.front() else { continue };

                if front.is_expired(now) {
                    let mut expired = queue.pop_front().expect("front just checked");
                    expired.status = MessageStatus::Expired;
                    inner.metrics.total_expired += 1;
                    self.persist(&inner);
                    drop(inner);
                    self.emit(QueueEvent::Expired(expired));
                    // restart the scan: state changed underneath us
                    return Box::pin(self.next_ready()).await;
                }

                if let Some(handler) = inner.handlers.get(&front.receiver.id).cloned() {
                    let message = queue.pop_front().expect("front just checked");
                    drop(inner);
                    return Some((message, handler));
                }
                // No handler registered for this receiver: leave queued,
                // try the next priority bucket.
            }

            return None;
        }
    }

    async fn deliver(self: &Arc<Self>, mut message: Message, handler: Arc<dyn MessageHandler>) {
        let retry_count = message.delivery_options.retry_count;
        let mut attempts: u32 = 0;
        let start = self.clock.now();

        loop {
            attempts += 1;
            match handler.handle(&message).await {
                Ok(()) => {
                    message.status = MessageStatus::Delivered;
                    message.metadata.delivery_attempts = attempts;
                    message.metadata.delivered_at = Some(self.clock.now());
                    let duration_ms = (self.clock.now() - start).num_milliseconds().max(0) as u64;

                    let mut inner = self.inner.lock().await;
                    inner.metrics.total_delivered += 1;
                    inner.metrics.avg_delivery_ms = ema(inner.metrics.avg_delivery_ms, duration_ms as f64);

                    if message.delivery_options.require_ack {
                        let deadline = self.clock.now()
                            + chrono::Duration::milliseconds(
                                message.delivery_options.timeout_ms as i64,
                            );
                        inner.pending_ack.insert(
                            message.id,
                            PendingAck {
                                message: message.clone(),
                                deadline,
                            },
                        );
                    } else {
                        inner.processed_ids.insert(message.id);
                    }
                    self.persist(&inner);
                    drop(inner);

                    info!(message_id = %message.id, attempts, duration_ms, "message delivered");
                    self.emit(QueueEvent::Delivered { message, duration_ms });
                    return;
                }
                Err(e) => {
                    message.metadata.delivery_attempts = attempts;
                    message.metadata.last_error = Some(e.to_string());

                    if attempts <= retry_count {
                        let backoff_ms = std::cmp::min(1000u64 * 2u64.pow(attempts - 1), 30_000);
                        warn!(
                            message_id = %message.id,
                            attempts,
                            backoff_ms,
                            error = %e,
                            "handler failed, retrying"
                        );
                        self.clock.sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }

                    message.status = MessageStatus::Failed;
                    let mut inner = self.inner.lock().await;
                    inner.metrics.total_failed += 1;
                    inner.processed_ids.insert(message.id);
                    self.persist(&inner);
                    drop(inner);

                    warn!(message_id = %message.id, attempts, "message failed permanently");
                    self.emit(QueueEvent::Failed {
                        message,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    /// Periodic sweep ("Cleanup"): expires anything past its TTL in
    /// either the active queue or the pending-ack map.
    pub async fn sweep_expired(&self) {
        let now = self.clock.now();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for queue in inner.priority_queues.values_mut() {
                let mut i = 0;
                while i < queue.len() {
                    if queue[i].is_expired(now) {
                        expired.push(queue.remove(i).expect("index in bounds"));
                    } else {
                        i += 1;
                    }
                }
            }

            let ack_timed_out: Vec<Uuid> = inner
                .pending_ack
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(id, _)| *id)
                .collect();
            for id in ack_timed_out {
                if let Some(mut pending) = inner.pending_ack.remove(&id) {
                    pending.message.status = MessageStatus::Failed;
                    pending.message.metadata.last_error = Some("ack-timeout".to_string());
                    inner.metrics.total_failed += 1;
                    inner.processed_ids.insert(id);
                    expired.push(pending.message);
                }
            }

            inner.metrics.total_expired += expired.len() as u64;
            self.persist(&inner);
        }

        for message in expired {
            self.emit(QueueEvent::Expired(message));
        }
    }

    /// Spawn the dispatcher as a background loop, driven by enqueue/ack/
    /// handler-registration notifications and the periodic cleanup sweep.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep_expired().await,
                _ = self.notify.notified() => {}
            }
            self.dispatch_once().await;
        }
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    const ALPHA: f64 = 0.2;
    if previous == 0.0 {
        sample
    } else {
        ALPHA * sample + (1.0 - ALPHA) * previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentId, MessageContent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    fn opts(receiver: &str, priority: Priority, status: &str) -> EnqueueOptions {
        EnqueueOptions::new(
            AgentId::orchestrator(),
            AgentId::worker(receiver, Uuid::new_v4()),
            MessageContent::StatusUpdate {
                status: status.to_string(),
                detail: None,
            },
        )
        .with_priority(priority)
    }

    struct RecordingHandler {
        order: Arc<TokioMutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: &Message) -> anyhow::Result<()> {
            if let MessageContent::StatusUpdate { status, .. } = &message.content {
                self.order.lock().await.push(status.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn priority_ordering_delivers_highest_first() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());

        queue.enqueue(opts("r", Priority::Low, "low")).await.unwrap();
        queue
            .enqueue(opts("r", Priority::Critical, "critical"))
            .await
            .unwrap();
        queue.enqueue(opts("r", Priority::Normal, "normal")).await.unwrap();
        queue.enqueue(opts("r", Priority::High, "high")).await.unwrap();

        let order = Arc::new(TokioMutex::new(Vec::new()));
        queue
            .register_handler("r", Arc::new(RecordingHandler { order: order.clone() }))
            .await;

        queue.dispatch_once().await;

        let observed = order.lock().await.clone();
        assert_eq!(observed, vec!["critical", "high", "normal", "low"]);
    }

    struct FailingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn retry_then_fail_calls_handler_retry_count_plus_one_times() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());

        let mut options = opts("r", Priority::Normal, "status");
        options.delivery_options.retry_count = 2;
        queue.enqueue(options).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        queue
            .register_handler("r", Arc::new(FailingHandler { calls: calls.clone() }))
            .await;

        let mut events = queue.subscribe_events();
        queue.dispatch_once().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = queue.get_metrics().await;
        assert_eq!(metrics.total_failed, 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, QueueEvent::Enqueued(_)));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, QueueEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn retry_count_zero_fails_on_first_error() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());

        let mut options = opts("r", Priority::Normal, "status");
        options.delivery_options.retry_count = 0;
        queue.enqueue(options).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        queue
            .register_handler("r", Arc::new(FailingHandler { calls: calls.clone() }))
            .await;
        queue.dispatch_once().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_when_full() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let mut config = QueueConfig::default();
        config.max_queue_size = 1;
        let queue = MessageQueue::new(clock, config);

        queue.enqueue(opts("r", Priority::Normal, "a")).await.unwrap();
        let result = queue.enqueue(opts("r", Priority::Normal, "b")).await;
        assert!(matches!(result, Err(QueueError::QueueFull { max: 1 })));
    }

    #[tokio::test]
    async fn ttl_zero_expires_before_delivery() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());

        let mut options = opts("r", Priority::Normal, "a");
        options.delivery_options.ttl_ms = 0;
        queue.enqueue(options).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        queue
            .register_handler("r", Arc::new(FailingHandler { calls: calls.clone() }))
            .await;
        queue.dispatch_once().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get_metrics().await.total_expired, 1);
    }

    #[tokio::test]
    async fn cancel_message_is_idempotent() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());
        let message = queue.enqueue(opts("r", Priority::Normal, "a")).await.unwrap();

        assert!(queue.cancel_message(message.id).await);
        assert!(!queue.cancel_message(message.id).await);
        assert!(!queue.cancel_message(message.id).await);
    }

    #[tokio::test]
    async fn message_never_in_both_queue_and_pending_ack() {
        let clock = Arc::new(crate::clock::FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock, QueueConfig::default());

        let mut options = opts("r", Priority::Normal, "a");
        options.delivery_options.require_ack = true;
        let message = queue.enqueue(options).await.unwrap();

        queue
            .register_handler("r", Arc::new(RecordingHandler { order: Arc::new(TokioMutex::new(vec![])) }))
            .await;
        queue.dispatch_once().await;

        let inner = queue.inner.lock().await;
        let in_queue = inner
            .priority_queues
            .values()
            .any(|q| q.iter().any(|m| m.id == message.id));
        let in_pending = inner.pending_ack.contains_key(&message.id);
        assert!(in_pending);
        assert!(!in_queue);
    }
}
