//! The external collaborator seams for language-model backends: the language
//! model backend and tool-invocation layer are not implemented here, only
//! the interfaces a [`crate::session::WorkerSession`] drives them through.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::stream::StreamEvent;

/// A request a turn makes to invoke a tool, possibly gated on approval.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub requires_approval: bool,
}

/// What a single turn produced.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub stream_events: Vec<StreamEvent>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub done: bool,
}

/// Given a conversation (as raw text turns, the concrete session owns
/// shaping its own log into whatever prompt format it likes) and a
/// cancellation signal, produce response parts and tool-call requests.
///
/// Concrete language-model backends are out of scope; this trait is
/// the seam a fake/test double implements.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn run_turn(
        &self,
        conversation: &[String],
        cancel: CancellationToken,
    ) -> anyhow::Result<TurnOutput>;
}

/// The tool-invocation interface: executing a tool call that may first need
/// [`crate::session::approval::ApprovalTable`] to resolve.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, call: &ToolCallRequest, approval_id: Option<Uuid>) -> anyhow::Result<serde_json::Value>;
}
