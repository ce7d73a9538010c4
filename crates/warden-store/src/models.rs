//! Persisted data model shared by every subsystem in `warden-core`.
//!
//! These types mirror the wire/persistence shapes described in the runtime's
//! data model: a message bus entry, a task, a plan, a routing rule, a route
//! record, and worktree registry info. Each enum follows the same pattern —
//! `Display` + `FromStr` with a dedicated parse-error type — so malformed
//! persisted data produces a clear error instead of a panic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Agent identifier
// ---------------------------------------------------------------------------

/// Kind of participant a message can be addressed to or from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Orchestrator,
    Worker,
    Agent,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentKind::Orchestrator => "orchestrator",
            AgentKind::Worker => "worker",
            AgentKind::Agent => "agent",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent kind: {0:?}")]
pub struct AgentKindParseError(String);

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(AgentKind::Orchestrator),
            "worker" => Ok(AgentKind::Worker),
            "agent" => Ok(AgentKind::Agent),
            other => Err(AgentKindParseError(other.to_string())),
        }
    }
}

/// Unique-within-process identifier for an orchestrator, worker, or agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentId {
    pub kind: AgentKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ref: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
}

impl AgentId {
    pub fn worker(id: impl Into<String>, session_ref: Uuid) -> Self {
        Self {
            kind: AgentKind::Worker,
            id: id.into(),
            session_ref: Some(session_ref),
            worktree_path: None,
        }
    }

    pub fn orchestrator() -> Self {
        Self {
            kind: AgentKind::Orchestrator,
            id: "orchestrator".to_string(),
            session_ref: None,
            worktree_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message enums
// ---------------------------------------------------------------------------

macro_rules! display_fromstr_enum {
    ($name:ident, $err:ident, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $s),+
                };
                write!(f, "{s}")
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
        #[error(concat!("invalid ", stringify!($name), ": {0:?}"))]
        pub struct $err(pub String);

        impl FromStr for $name {
            type Err = $err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err($err(other.to_string())),
                }
            }
        }
    };
}

/// The kind of a message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    StatusUpdate,
    Question,
    Completion,
    Error,
    ApprovalRequest,
    ApprovalResponse,
    Refinement,
    RetryRequest,
    Heartbeat,
    Cancellation,
}

display_fromstr_enum!(MessageType, MessageTypeParseError, {
    StatusUpdate => "status_update",
    Question => "question",
    Completion => "completion",
    Error => "error",
    ApprovalRequest => "approval_request",
    ApprovalResponse => "approval_response",
    Refinement => "refinement",
    RetryRequest => "retry_request",
    Heartbeat => "heartbeat",
    Cancellation => "cancellation",
});

/// Delivery priority. Ordered `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

display_fromstr_enum!(Priority, PriorityParseError, {
    Critical => "critical",
    High => "high",
    Normal => "normal",
    Low => "low",
});

/// Lifecycle status of a message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
    Expired,
}

display_fromstr_enum!(MessageStatus, MessageStatusParseError, {
    Pending => "pending",
    Delivered => "delivered",
    Acknowledged => "acknowledged",
    Failed => "failed",
    Expired => "expired",
});

// ---------------------------------------------------------------------------
// Message content — tagged variant over the ten known shapes
// ---------------------------------------------------------------------------

/// The payload of a message. A tagged sum type over the known content
/// shapes; an unrecognized `kind` survives round-trips as `Unknown` instead
/// of failing to deserialize, per the runtime's schema-evolution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    StatusUpdate { status: String, detail: Option<String> },
    Question { text: String },
    Completion { summary: String },
    Error { message: String },
    ApprovalRequest {
        tool_name: String,
        tool_call_id: String,
        description: String,
        params: serde_json::Value,
    },
    ApprovalResponse {
        approval_id: Uuid,
        approved: bool,
        clarification: Option<String>,
    },
    Refinement { text: String },
    RetryRequest { reason: String },
    Heartbeat,
    Cancellation { reason: Option<String> },
    /// Catch-all for forward compatibility: an unrecognized discriminator
    /// plus its opaque payload, preserved verbatim through persistence.
    Unknown {
        discriminator: String,
        blob: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Message metadata / delivery options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
}

impl MessageMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            delivery_attempts: 0,
            last_error: None,
            correlation_id: None,
            trace_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub require_ack: bool,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_count: default_retry_count(),
            require_ack: false,
            ttl_ms: default_ttl_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub status: MessageStatus,
    pub sender: AgentId,
    pub receiver: AgentId,
    pub content: MessageContent,
    pub metadata: MessageMetadata,
    pub delivery_options: DeliveryOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<Uuid>,
    #[serde(default)]
    pub depth: u32,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.metadata.created_at).num_milliseconds().max(0) as u64;
        age_ms >= self.delivery_options.ttl_ms
    }
}

// ---------------------------------------------------------------------------
// Task / Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

display_fromstr_enum!(TaskStatus, TaskStatusParseError, {
    Pending => "pending",
    Assigned => "assigned",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub description: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_uri: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    New,
    Running,
    Paused,
    Completed,
    Failed,
}

display_fromstr_enum!(PlanStatus, PlanStatusParseError, {
    New => "new",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub base_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Routing rule / route record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Route,
    Broadcast,
    Drop,
    Transform,
    Delay,
}

display_fromstr_enum!(RuleAction, RuleActionParseError, {
    Route => "route",
    Broadcast => "broadcast",
    Drop => "drop",
    Transform => "transform",
    Delay => "delay",
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilters {
    #[serde(default)]
    pub message_types: Vec<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_pattern: Option<String>,
    #[serde(default)]
    pub priority_filter: Vec<Priority>,
    #[serde(default)]
    pub plan_id_filter: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub action: RuleAction,
    #[serde(default)]
    pub filters: RuleFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteHopAction {
    Enqueued,
    Delivered,
    Failed,
    Routed,
    Dropped,
    Transformed,
    Delayed,
}

display_fromstr_enum!(RouteHopAction, RouteHopActionParseError, {
    Enqueued => "enqueued",
    Delivered => "delivered",
    Failed => "failed",
    Routed => "routed",
    Dropped => "dropped",
    Transformed => "transformed",
    Delayed => "delayed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHop {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: RouteHopAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub message_id: Uuid,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub hops: Vec<RouteHop>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Worktree info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub session_id: Uuid,
    pub worktree_path: String,
    pub branch_name: String,
    pub base_branch: String,
    pub repo_path: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_display_roundtrip() {
        for p in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            let s = p.to_string();
            assert_eq!(Priority::from_str(&s).unwrap(), p);
        }
    }

    #[test]
    fn priority_ordering_is_strict() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_invalid_str() {
        assert!(Priority::from_str("urgent").is_err());
    }

    #[test]
    fn message_type_display_roundtrip() {
        for t in [
            MessageType::StatusUpdate,
            MessageType::Question,
            MessageType::Completion,
            MessageType::Error,
            MessageType::ApprovalRequest,
            MessageType::ApprovalResponse,
            MessageType::Refinement,
            MessageType::RetryRequest,
            MessageType::Heartbeat,
            MessageType::Cancellation,
        ] {
            assert_eq!(MessageType::from_str(&t.to_string()).unwrap(), t);
        }
    }

    #[test]
    fn task_status_display_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn message_content_unknown_variant_roundtrips() {
        let content = MessageContent::Unknown {
            discriminator: "future_shape".to_string(),
            blob: serde_json::json!({"x": 1}),
        };
        let json = serde_json::to_string(&content).unwrap();
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(content, back);
    }

    #[test]
    fn message_serialize_deserialize_roundtrip_preserves_fields() {
        let now = Utc::now();
        let msg = Message {
            id: Uuid::new_v4(),
            message_type: MessageType::StatusUpdate,
            priority: Priority::High,
            status: MessageStatus::Pending,
            sender: AgentId::orchestrator(),
            receiver: AgentId::worker("w1", Uuid::new_v4()),
            content: MessageContent::StatusUpdate {
                status: "working".to_string(),
                detail: None,
            },
            metadata: MessageMetadata::new(now),
            delivery_options: DeliveryOptions::default(),
            plan_id: Some(Uuid::new_v4()),
            task_id: None,
            subtask_id: None,
            depth: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.priority, msg.priority);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.plan_id, msg.plan_id);
    }

    #[test]
    fn message_is_expired_respects_ttl() {
        let now = Utc::now();
        let mut msg_meta = MessageMetadata::new(now - chrono::Duration::milliseconds(10));
        msg_meta.created_at = now - chrono::Duration::milliseconds(10);
        let msg = Message {
            id: Uuid::new_v4(),
            message_type: MessageType::Heartbeat,
            priority: Priority::Low,
            status: MessageStatus::Pending,
            sender: AgentId::orchestrator(),
            receiver: AgentId::orchestrator(),
            content: MessageContent::Heartbeat,
            metadata: msg_meta,
            delivery_options: DeliveryOptions {
                ttl_ms: 0,
                ..Default::default()
            },
            plan_id: None,
            task_id: None,
            subtask_id: None,
            depth: 0,
        };
        assert!(msg.is_expired(now));
    }
}
