//! Message types used across the queue, router, and worker session.
//!
//! The persisted shapes (`Message`, `MessageContent`, enums, …) live in
//! `warden_store::models` since they are exactly what gets written to the
//! queue state file; this module re-exports them for ergonomic use from
//! `warden_core` call sites and adds the non-persisted `EnqueueOptions`
//! builder input.

pub use warden_store::models::{
    AgentId, AgentKind, DeliveryOptions, Message, MessageContent, MessageMetadata, MessageStatus,
    MessageType, Priority,
};

use uuid::Uuid;

/// Input to [`crate::queue::MessageQueue::enqueue`]. Everything the queue
/// itself assigns (`id`, `status`, `metadata.created_at`, …) is absent here.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub message_type: MessageType,
    pub priority: Priority,
    pub sender: AgentId,
    pub receiver: AgentId,
    pub content: MessageContent,
    pub delivery_options: DeliveryOptions,
    pub plan_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub depth: u32,
}

impl EnqueueOptions {
    pub fn new(sender: AgentId, receiver: AgentId, content: MessageContent) -> Self {
        Self {
            message_type: content_default_type(&content),
            priority: Priority::Normal,
            sender,
            receiver,
            content,
            delivery_options: DeliveryOptions::default(),
            plan_id: None,
            task_id: None,
            subtask_id: None,
            depth: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delivery_options(mut self, options: DeliveryOptions) -> Self {
        self.delivery_options = options;
        self
    }
}

pub(crate) fn content_default_type(content: &MessageContent) -> MessageType {
    match content {
        MessageContent::StatusUpdate { .. } => MessageType::StatusUpdate,
        MessageContent::Question { .. } => MessageType::Question,
        MessageContent::Completion { .. } => MessageType::Completion,
        MessageContent::Error { .. } => MessageType::Error,
        MessageContent::ApprovalRequest { .. } => MessageType::ApprovalRequest,
        MessageContent::ApprovalResponse { .. } => MessageType::ApprovalResponse,
        MessageContent::Refinement { .. } => MessageType::Refinement,
        MessageContent::RetryRequest { .. } => MessageType::RetryRequest,
        MessageContent::Heartbeat => MessageType::Heartbeat,
        MessageContent::Cancellation { .. } => MessageType::Cancellation,
        MessageContent::Unknown { .. } => MessageType::StatusUpdate,
    }
}
