//! Rule-driven dispatch layer sitting on top of the [`crate::queue::MessageQueue`]
//! Message router: pattern-matched routing rules, broadcast, subscription fan-out,
//! and optional route tracing.

pub mod pattern;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ErrorKind, TaxonomyError};
use crate::message::{AgentId, Message, MessageContent, MessageStatus, Priority};
use crate::queue::{MessageQueue, QueueError, QueueEvent};
use warden_store::models::{
    DeliveryOptions, MessageMetadata, MessageType, RouteHop, RouteHopAction, RouteRecord, RuleAction,
    RuleFilters, RoutingRule,
};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("routing rule {0} has action `route` but no target_agent_id")]
    MissingRouteTarget(Uuid),
    #[error("routing rule {0} has action `transform` but no transform registered")]
    MissingTransform(Uuid),
}

impl TaxonomyError for RouterError {
    fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Queue(e) => e.kind(),
            RouterError::MissingRouteTarget(_) | RouterError::MissingTransform(_) => {
                ErrorKind::Validation
            }
        }
    }
}

/// A message sent to the router for dispatch. Identical in shape to
/// [`crate::queue::MessageQueue::enqueue`]'s input; the router owns
/// constructing the final [`crate::message::EnqueueOptions`] after rules run.
pub use crate::message::EnqueueOptions as SendOptions;

/// Transform hook a `transform` rule invokes. Registered out of band since
/// closures cannot be embedded in the persisted [`RoutingRule`].
pub type TransformFn = Arc<dyn Fn(&MessageContent, Priority) -> (MessageContent, Priority) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub message_types: Vec<MessageType>,
    pub sender_patterns: Vec<String>,
    pub priority_filter: Vec<Priority>,
    pub plan_id_filter: Vec<Uuid>,
}

impl SubscriptionFilter {
    fn matches(&self, message: &Message) -> bool {
        if !self.message_types.is_empty() && !self.message_types.contains(&message.message_type) {
            return false;
        }
        if !self.sender_patterns.is_empty()
            && !self
                .sender_patterns
                .iter()
                .any(|p| pattern::matches(p, &message.sender.id))
        {
            return false;
        }
        if !self.priority_filter.is_empty() && !self.priority_filter.contains(&message.priority) {
            return false;
        }
        if !self.plan_id_filter.is_empty() {
            let Some(plan_id) = message.plan_id else {
                return false;
            };
            if !self.plan_id_filter.contains(&plan_id) {
                return false;
            }
        }
        true
    }
}

struct Subscription {
    id: Uuid,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Message>,
}

#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    pub total_sent: u64,
    pub total_dropped: u64,
    pub total_routed: u64,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub trace_routes: bool,
    /// Bound on each subscriber's buffered channel; oldest events are
    /// dropped on overflow ("buffered channels ... drop-oldest").
    pub subscriber_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            trace_routes: false,
            subscriber_buffer: 256,
        }
    }
}

pub struct MessageRouter {
    queue: Arc<MessageQueue>,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
    rules: Mutex<Vec<RoutingRule>>,
    transforms: Mutex<HashMap<Uuid, TransformFn>>,
    subscriptions: Mutex<Vec<Subscription>>,
    traces: Mutex<HashMap<Uuid, RouteRecord>>,
    metrics: Mutex<RouterMetrics>,
}

impl MessageRouter {
    pub fn new(queue: Arc<MessageQueue>, clock: Arc<dyn Clock>, config: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            clock,
            config,
            rules: Mutex::new(Vec::new()),
            transforms: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            traces: Mutex::new(HashMap::new()),
            metrics: Mutex::new(RouterMetrics::default()),
        })
    }

    /// Spawn the background task that listens to queue delivery events and
    /// appends terminal hops to in-flight route traces. No-op unless
    /// `config.trace_routes` is set.
    pub fn spawn_trace_listener(self: &Arc<Self>, cancel: CancellationToken) {
        if !self.config.trace_routes {
            return;
        }
        let this = Arc::clone(self);
        let mut events = this.queue.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Ok(event) = event else { break };
                        this.record_terminal_hop(event).await;
                    }
                }
            }
        });
    }

    async fn record_terminal_hop(&self, event: QueueEvent) {
        let (message_id, action, duration_ms) = match event {
            QueueEvent::Delivered { message, duration_ms } => {
                (message.id, RouteHopAction::Delivered, Some(duration_ms))
            }
            QueueEvent::Failed { message, .. } => (message.id, RouteHopAction::Failed, None),
            _ => return,
        };

        let mut traces = self.traces.lock().await;
        if let Some(record) = traces.get_mut(&message_id) {
            record.hops.push(RouteHop {
                agent_id: record.destination.clone(),
                timestamp: self.clock.now(),
                action,
                duration_ms,
            });
            record.status = match action {
                RouteHopAction::Delivered => MessageStatus::Delivered,
                RouteHopAction::Failed => MessageStatus::Failed,
                _ => record.status,
            };
            record.completed_at = Some(self.clock.now());
        }
    }

    pub async fn add_rule(&self, rule: RoutingRule) {
        let mut rules = self.rules.lock().await;
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub async fn remove_rule(&self, id: Uuid) {
        self.rules.lock().await.retain(|r| r.id != id);
        self.transforms.lock().await.remove(&id);
    }

    pub async fn register_transform(&self, rule_id: Uuid, f: TransformFn) {
        self.transforms.lock().await.insert(rule_id, f);
    }

    pub async fn metrics(&self) -> RouterMetrics {
        self.metrics.lock().await.clone()
    }

    /// The queue this router dispatches through, for callers (e.g. the
    /// orchestrator) that need to register a per-agent [`MessageHandler`]
    /// directly.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Apply enabled rules in descending `rule.priority`, then dispatch via
    /// the queue.
    pub async fn send(&self, options: SendOptions) -> Result<Message, RouterError> {
        let mut receiver = options.receiver.clone();
        let mut content = options.content.clone();
        let mut priority = options.priority;
        let mut delivery_options = options.delivery_options.clone();
        let sender = options.sender.clone();

        let rules = self.rules.lock().await.clone();
        for rule in rules.iter().filter(|r| r.enabled) {
            if !filters_match(&rule.filters, &sender, &receiver, &content, priority, options.plan_id) {
                continue;
            }

            match rule.action {
                RuleAction::Drop => {
                    self.metrics.lock().await.total_dropped += 1;
                    debug!(rule = %rule.name, "rule dropped message");
                    let now = self.clock.now();
                    return Ok(Message {
                        id: Uuid::new_v4(),
                        message_type: options.message_type,
                        priority,
                        status: MessageStatus::Failed,
                        sender,
                        receiver,
                        content,
                        metadata: MessageMetadata::new(now),
                        delivery_options,
                        plan_id: options.plan_id,
                        task_id: options.task_id,
                        subtask_id: options.subtask_id,
                        depth: options.depth,
                    });
                }
                RuleAction::Route => {
                    let Some(target) = rule.target_agent_id.clone() else {
                        return Err(RouterError::MissingRouteTarget(rule.id));
                    };
                    receiver.id = target;
                    self.metrics.lock().await.total_routed += 1;
                }
                RuleAction::Transform => {
                    let transforms = self.transforms.lock().await;
                    let Some(f) = transforms.get(&rule.id) else {
                        return Err(RouterError::MissingTransform(rule.id));
                    };
                    let (new_content, new_priority) = f(&content, priority);
                    content = new_content;
                    priority = new_priority;
                }
                RuleAction::Delay => {
                    delivery_options.timeout_ms += rule.delay_ms.unwrap_or(0);
                }
                RuleAction::Broadcast => {
                    // No-op at rule evaluation; see `Self::broadcast`.
                }
            }
        }

        let final_options = SendOptions {
            message_type: options.message_type,
            priority,
            sender: sender.clone(),
            receiver: receiver.clone(),
            content,
            delivery_options,
            plan_id: options.plan_id,
            task_id: options.task_id,
            subtask_id: options.subtask_id,
            depth: options.depth,
        };

        let message = self.queue.enqueue(final_options).await?;
        self.metrics.lock().await.total_sent += 1;

        if self.config.trace_routes {
            let mut traces = self.traces.lock().await;
            traces.insert(
                message.id,
                RouteRecord {
                    message_id: message.id,
                    source: sender.id.clone(),
                    destination: receiver.id.clone(),
                    hops: vec![RouteHop {
                        agent_id: sender.id.clone(),
                        timestamp: message.metadata.created_at,
                        action: RouteHopAction::Enqueued,
                        duration_ms: None,
                    }],
                    status: MessageStatus::Pending,
                    created_at: message.metadata.created_at,
                    completed_at: None,
                },
            );
        }

        self.notify_subscribers(&message).await;
        Ok(message)
    }

    pub async fn broadcast(
        &self,
        options_without_receiver: SendOptions,
        recipients: Vec<AgentId>,
    ) -> Result<Vec<Message>, RouterError> {
        let mut sent = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut opts = options_without_receiver.clone();
            opts.receiver = recipient;
            sent.push(self.send(opts).await?);
        }
        Ok(sent)
    }

    pub async fn route_trace(&self, message_id: Uuid) -> Option<RouteRecord> {
        self.traces.lock().await.get(&message_id).cloned()
    }

    /// Register a fan-out subscription notified after every successful
    /// `send` (not after delivery). Returns the subscription id (for
    /// `unsubscribe`) and the receiving end of a bounded channel.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> (Uuid, mpsc::Receiver<Message>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        self.subscriptions.lock().await.push(Subscription {
            id,
            filter,
            sender: tx,
        });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscriptions.lock().await.retain(|s| s.id != id);
    }

    async fn notify_subscribers(&self, message: &Message) {
        let subscriptions = self.subscriptions.lock().await;
        for sub in subscriptions.iter() {
            if !sub.filter.matches(message) {
                continue;
            }
            // Bounded channel; a full buffer means a slow subscriber falls
            // behind and loses the oldest-pending notification rather than
            // stalling the sender.
            if sub.sender.try_send(message.clone()).is_err() {
                warn!(subscription = %sub.id, "subscriber buffer full, dropping notification");
            }
        }
    }
}

fn filters_match(
    filters: &RuleFilters,
    sender: &AgentId,
    receiver: &AgentId,
    content: &MessageContent,
    priority: Priority,
    plan_id: Option<Uuid>,
) -> bool {
    if !filters.message_types.is_empty() {
        let message_type = crate::message::content_default_type(content);
        if !filters.message_types.contains(&message_type) {
            return false;
        }
    }
    if let Some(pattern) = &filters.source_pattern {
        if !pattern::matches(pattern, &sender.id) {
            return false;
        }
    }
    if let Some(pattern) = &filters.destination_pattern {
        if !pattern::matches(pattern, &receiver.id) {
            return false;
        }
    }
    if !filters.priority_filter.is_empty() && !filters.priority_filter.contains(&priority) {
        return false;
    }
    if !filters.plan_id_filter.is_empty() {
        let Some(plan_id) = plan_id else { return false };
        if !filters.plan_id_filter.contains(&plan_id) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::queue::QueueConfig;

    fn status_update(sender: AgentId, receiver: AgentId, status: &str) -> SendOptions {
        SendOptions::new(
            sender,
            receiver,
            MessageContent::StatusUpdate {
                status: status.to_string(),
                detail: None,
            },
        )
    }

    fn router() -> (Arc<MessageQueue>, Arc<MessageRouter>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(Arc::clone(&clock) as Arc<dyn Clock>, QueueConfig::default());
        let router = MessageRouter::new(Arc::clone(&queue), clock, RouterConfig::default());
        (queue, router)
    }

    #[tokio::test]
    async fn drop_rule_short_circuits_without_enqueueing() {
        let (queue, router) = router();
        router
            .add_rule(RoutingRule {
                id: Uuid::new_v4(),
                name: "block-worker".to_string(),
                priority: 10,
                enabled: true,
                action: RuleAction::Drop,
                filters: RuleFilters::default(),
                target_agent_id: None,
                delay_ms: None,
            })
            .await;

        let message = router
            .send(status_update(
                AgentId::orchestrator(),
                AgentId::worker("w1", Uuid::new_v4()),
                "hi",
            ))
            .await
            .unwrap();

        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(queue.depth().await, 0);
        assert_eq!(router.metrics().await.total_dropped, 1);
    }

    #[tokio::test]
    async fn route_rule_rewrites_receiver() {
        let (queue, router) = router();
        router
            .add_rule(RoutingRule {
                id: Uuid::new_v4(),
                name: "redirect".to_string(),
                priority: 10,
                enabled: true,
                action: RuleAction::Route,
                filters: RuleFilters::default(),
                target_agent_id: Some("w2".to_string()),
                delay_ms: None,
            })
            .await;

        let message = router
            .send(status_update(
                AgentId::orchestrator(),
                AgentId::worker("w1", Uuid::new_v4()),
                "hi",
            ))
            .await
            .unwrap();

        assert_eq!(message.receiver.id, "w2");
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn subscriber_receives_message_after_send() {
        let (_queue, router) = router();
        let (_id, mut rx) = router.subscribe(SubscriptionFilter::default()).await;

        router
            .send(status_update(
                AgentId::orchestrator(),
                AgentId::worker("w1", Uuid::new_v4()),
                "hi",
            ))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        if let MessageContent::StatusUpdate { status, .. } = received.content {
            assert_eq!(status, "hi");
        } else {
            panic!("unexpected content");
        }
    }

    #[tokio::test]
    async fn dropped_message_is_stamped_from_injected_clock() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(Arc::clone(&clock) as Arc<dyn Clock>, QueueConfig::default());
        let router = MessageRouter::new(Arc::clone(&queue), Arc::clone(&clock) as Arc<dyn Clock>, RouterConfig::default());
        router
            .add_rule(RoutingRule {
                id: Uuid::new_v4(),
                name: "block-worker".to_string(),
                priority: 10,
                enabled: true,
                action: RuleAction::Drop,
                filters: RuleFilters::default(),
                target_agent_id: None,
                delay_ms: None,
            })
            .await;

        clock.advance(std::time::Duration::from_secs(5));
        let message = router
            .send(status_update(
                AgentId::orchestrator(),
                AgentId::worker("w1", Uuid::new_v4()),
                "hi",
            ))
            .await
            .unwrap();

        assert_eq!(message.metadata.created_at, clock.now());
    }

    #[tokio::test]
    async fn broadcast_sends_to_every_recipient() {
        let (queue, router) = router();
        let recipients = vec![
            AgentId::worker("w1", Uuid::new_v4()),
            AgentId::worker("w2", Uuid::new_v4()),
        ];

        let sent = router
            .broadcast(
                status_update(AgentId::orchestrator(), AgentId::worker("placeholder", Uuid::new_v4()), "go"),
                recipients,
            )
            .await
            .unwrap();

        assert_eq!(sent.len(), 2);
        assert_eq!(queue.depth().await, 2);
    }
}
