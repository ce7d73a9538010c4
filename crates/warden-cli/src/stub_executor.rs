//! A minimal, no-op `TurnExecutor`/`ToolInvoker` pair.
//!
//! Concrete language-model backends and tool implementations are declared
//! out of scope for the core runtime and treated as external collaborators
//! reached only through those two traits. This binary has no LM backend to
//! wire in, so `task deploy` drives every worker session against this stub:
//! one turn that immediately reports `done`, and a tool invoker that
//! acknowledges every call without executing anything. It exists solely to
//! make the orchestrator's `deploy` path runnable end-to-end from the CLI;
//! a real agent integration replaces both traits wholesale.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use warden_core::session::stream::StreamEvent;
use warden_core::turn_executor::{ToolCallRequest, ToolInvoker, TurnExecutor, TurnOutput};

pub struct NullTurnExecutor;

#[async_trait]
impl TurnExecutor for NullTurnExecutor {
    async fn run_turn(
        &self,
        conversation: &[String],
        _cancel: CancellationToken,
    ) -> anyhow::Result<TurnOutput> {
        let last = conversation.last().cloned().unwrap_or_default();
        Ok(TurnOutput {
            stream_events: vec![StreamEvent::StreamPart {
                text: format!("no turn executor configured; last message was: {last}"),
            }],
            tool_calls: Vec::new(),
            done: true,
        })
    }
}

pub struct NullToolInvoker;

#[async_trait]
impl ToolInvoker for NullToolInvoker {
    async fn invoke(
        &self,
        _call: &ToolCallRequest,
        _approval_id: Option<Uuid>,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}
