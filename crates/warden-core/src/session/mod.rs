//! Worker session: the per-worker state machine, conversation log,
//! approval/clarification protocols, response-stream fan-out, and hot-swap,
//! bound together behind one handle.

pub mod approval;
pub mod clarification;
pub mod hotswap;
pub mod log;
pub mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ErrorKind, TaxonomyError};
use crate::state::{dispatch, SessionError, SessionStatus};

use approval::{ApprovalDecision, ApprovalRequest, ApprovalTable};
use clarification::ClarificationChannel;
use log::{ConversationLog, LogEntry};
use stream::{FanOutStream, StreamEvent};

/// Default debounce window for coalescing streamed chunks into log writes.
const LOG_FLUSH_DEBOUNCE_MS: i64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum WorkerSessionError {
    #[error(transparent)]
    State(#[from] SessionError),
    #[error(transparent)]
    Approval(#[from] approval::UnknownApprovalError),
}

impl TaxonomyError for WorkerSessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkerSessionError::State(e) => e.kind(),
            WorkerSessionError::Approval(_) => ErrorKind::NotFound,
        }
    }
}

struct SessionInner {
    status: SessionStatus,
    agent_id: String,
    agent_instructions: Vec<String>,
    model_id: Option<String>,
    error_message: Option<String>,
    last_activity_at: DateTime<Utc>,
    log: ConversationLog,
    approvals: ApprovalTable,
    cancel: CancellationToken,
    /// Streamed text not yet committed to `log`, buffered across the
    /// debounce window.
    pending_chunk: String,
    last_log_flush_at: Option<DateTime<Utc>>,
}

/// The central aggregate of the runtime. Immutable identity fields are
/// plain struct fields; everything mutable lives behind `inner`.
pub struct WorkerSession {
    pub id: Uuid,
    pub name: String,
    pub task: String,
    pub worktree_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub plan_id: Option<Uuid>,
    pub base_branch: Option<String>,

    clock: Arc<dyn Clock>,
    inner: Mutex<SessionInner>,
    pub stream: FanOutStream,
    pub clarification: ClarificationChannel,
}

impl WorkerSession {
    pub fn new(
        clock: Arc<dyn Clock>,
        name: impl Into<String>,
        task: impl Into<String>,
        worktree_path: PathBuf,
        agent_id: impl Into<String>,
        plan_id: Option<Uuid>,
        base_branch: Option<String>,
    ) -> Self {
        let now = clock.now();
        let task = task.into();
        let mut log = ConversationLog::new();
        let _ = log.append(LogEntry::user(task.clone()));

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task,
            worktree_path,
            created_at: now,
            plan_id,
            base_branch,
            clock,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Idle,
                agent_id: agent_id.into(),
                agent_instructions: Vec::new(),
                model_id: None,
                error_message: None,
                last_activity_at: now,
                log,
                approvals: ApprovalTable::new(),
                cancel: CancellationToken::new(),
                pending_chunk: String::new(),
                last_log_flush_at: None,
            }),
            stream: FanOutStream::default(),
            clarification: ClarificationChannel::new(),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.lock().await.status
    }

    pub async fn agent_id(&self) -> String {
        self.inner.lock().await.agent_id.clone()
    }

    pub async fn error_message(&self) -> Option<String> {
        self.inner.lock().await.error_message.clone()
    }

    pub async fn cancellation_token(&self) -> CancellationToken {
        self.inner.lock().await.cancel.clone()
    }

    async fn touch(&self, inner: &mut SessionInner) {
        inner.last_activity_at = self.clock.now();
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        self.inner.lock().await.last_activity_at
    }

    pub async fn start(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::start(&mut inner.status)?;
        self.touch(&mut inner).await;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::pause(&mut inner.status)?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::resume(&mut inner.status)?;
        Ok(())
    }

    /// `interrupt` fires the cancel signal (if the session was active) and
    /// regenerates it for the next turn; a no-op from terminal/idle states.
    pub async fn interrupt(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        let was_active = matches!(
            inner.status,
            SessionStatus::Running | SessionStatus::WaitingApproval
        );
        dispatch::interrupt(&mut inner.status)?;
        if was_active {
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            let _ = inner
                .log
                .append(LogEntry::system("Session interrupted by user request."));
        }
        Ok(())
    }

    pub async fn turn_done(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::turn_done(&mut inner.status)?;
        Ok(())
    }

    pub async fn complete(&self) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::complete(&mut inner.status)?;
        inner.log.close();
        drop(inner);
        self.clarification.release();
        Ok(())
    }

    pub async fn fail(&self, message: impl Into<String>) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        dispatch::error(&mut inner.status)?;
        inner.error_message = Some(message.into());
        inner.log.close();
        drop(inner);
        self.clarification.release();
        Ok(())
    }

    pub async fn request_approval(
        &self,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        description: impl Into<String>,
        params: Value,
    ) -> Result<(Uuid, tokio::sync::oneshot::Receiver<ApprovalDecision>), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        let (id, rx) = inner
            .approvals
            .request(tool_name, tool_call_id, description, params);
        dispatch::request_approval(&mut inner.status)?;
        Ok((id, rx))
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.inner.lock().await.approvals.list()
    }

    /// Resolve a pending approval; if it was the last one, the session
    /// returns to `running`.
    pub async fn handle_approval(
        &self,
        id: Uuid,
        approved: bool,
        clarification: Option<String>,
    ) -> Result<(), WorkerSessionError> {
        let mut inner = self.inner.lock().await;
        let now_empty = inner.approvals.resolve(id, approved, clarification)?;
        if now_empty {
            dispatch::last_approval_resolved(&mut inner.status)?;
        }
        Ok(())
    }

    pub async fn wait_for_clarification(&self) -> Option<String> {
        self.clarification.wait().await
    }

    pub async fn send_clarification(&self, text: impl Into<String>) {
        let text = text.into();
        {
            let mut inner = self.inner.lock().await;
            let _ = inner.log.append(LogEntry::user(text.clone()));
        }
        self.clarification.send(text);
    }

    pub async fn set_agent(&self, agent_id: impl Into<String>, instructions: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.agent_id = agent_id.into();
        inner.agent_instructions = instructions;
    }

    pub async fn set_model(&self, model_id: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        let model_id = model_id.into();
        hotswap::hot_swap_model(&mut inner.log, &model_id);
        inner.model_id = Some(model_id);
    }

    pub async fn hot_swap_agent(
        &self,
        new_agent_id: impl Into<String>,
        instructions: Vec<String>,
        preserve_context: bool,
    ) {
        let mut inner = self.inner.lock().await;
        let previous = inner.agent_id.clone();
        let new_agent_id = new_agent_id.into();
        hotswap::hot_swap_agent(&mut inner.log, &new_agent_id, &instructions, preserve_context);
        inner.agent_id = new_agent_id;
        inner.agent_instructions = instructions;
        info!(previous_agent = %previous, new_agent = %inner.agent_id, preserve_context, "hot-swapped agent");
    }

    pub async fn context_digest(&self) -> String {
        let inner = self.inner.lock().await;
        hotswap::context_digest(
            &inner.log,
            &self.task,
            &inner.agent_id,
            &inner
                .approvals
                .list()
                .into_iter()
                .map(|a| a.description)
                .collect::<Vec<_>>(),
            inner.error_message.as_deref(),
        )
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.inner.lock().await.log.entries().to_vec()
    }

    /// Fan out a stream part immediately, but debounce the log write: chunks
    /// are buffered and only committed to `log` once
    /// [`LOG_FLUSH_DEBOUNCE_MS`] has elapsed since the last flush, so a fast
    /// turn-executor emitting many small chunks does not take the log lock
    /// once per chunk.
    pub async fn emit_stream_part(&self, text: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.pending_chunk.push_str(text);
            let now = self.clock.now();
            let due = match inner.last_log_flush_at {
                None => true,
                Some(last) => now - last >= chrono::Duration::milliseconds(LOG_FLUSH_DEBOUNCE_MS),
            };
            if due {
                let chunk = std::mem::take(&mut inner.pending_chunk);
                let _ = inner.log.append_assistant_chunk(&chunk);
                inner.last_log_flush_at = Some(now);
            }
        }
        self.stream
            .emit(StreamEvent::StreamPart {
                text: text.to_string(),
            })
            .await;
    }

    /// Flushes any chunk still buffered by the debounce before closing the
    /// cursor, so no streamed text is lost at a message boundary.
    pub async fn start_new_message(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.pending_chunk.is_empty() {
            let chunk = std::mem::take(&mut inner.pending_chunk);
            let _ = inner.log.append_assistant_chunk(&chunk);
        }
        inner.last_log_flush_at = None;
        inner.log.start_new_message();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn session() -> WorkerSession {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        WorkerSession::new(
            clock,
            "worker-1",
            "Implement the thing",
            PathBuf::from("/tmp/worktree"),
            "@coder",
            None,
            None,
        )
    }

    #[tokio::test]
    async fn interrupt_then_resume_with_clarification() {
        let session = session();
        session.start().await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Running);

        session.interrupt().await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Idle);

        let waiter = {
            let session = &session;
            tokio::time::timeout(std::time::Duration::from_millis(100), session.wait_for_clarification())
        };
        let sender_task = async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            session.send_clarification("refocus on tests").await;
        };
        let (result, _) = tokio::join!(waiter, sender_task);
        assert_eq!(result.unwrap().as_deref(), Some("refocus on tests"));
    }

    #[tokio::test]
    async fn approval_resolution_returns_to_running_when_last_pending() {
        let session = session();
        session.start().await.unwrap();
        let (id, _rx) = session
            .request_approval("run_tests", "call-1", "run the suite", Value::Null)
            .await
            .unwrap();
        assert_eq!(session.status().await, SessionStatus::WaitingApproval);

        session.handle_approval(id, true, None).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Running);
    }

    #[tokio::test]
    async fn terminal_state_releases_clarification_waiter() {
        let session = Arc::new(session());
        session.start().await.unwrap();
        session.interrupt().await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Idle);

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.wait_for_clarification().await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        session.complete().await.unwrap();

        let result = waiter.await.unwrap();
        assert_eq!(result, None);
    }

    fn session_with_clock() -> (WorkerSession, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let session = WorkerSession::new(
            clock.clone(),
            "worker-1",
            "Implement the thing",
            PathBuf::from("/tmp/worktree"),
            "@coder",
            None,
            None,
        );
        (session, clock)
    }

    #[tokio::test]
    async fn rapid_stream_parts_coalesce_into_one_log_write() {
        let (session, clock) = session_with_clock();
        session.emit_stream_part("Hel").await;
        session.emit_stream_part("lo").await;
        clock.advance(std::time::Duration::from_millis(10));
        session.emit_stream_part(", wor").await;

        let entries = session.log_entries().await;
        assert_eq!(entries.len(), 1, "chunks within the debounce window stay one entry");
        assert_eq!(entries[0].content, "Hel");
    }

    #[tokio::test]
    async fn stream_parts_flush_once_debounce_elapses() {
        let (session, clock) = session_with_clock();
        session.emit_stream_part("Hel").await;
        clock.advance(std::time::Duration::from_millis(LOG_FLUSH_DEBOUNCE_MS as u64));
        session.emit_stream_part("lo").await;

        let entries = session.log_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "Hello");
    }

    #[tokio::test]
    async fn start_new_message_flushes_pending_chunk() {
        let (session, _clock) = session_with_clock();
        session.emit_stream_part("buffered").await;
        assert!(session.log_entries().await.is_empty(), "first chunk is held until flush or boundary");

        session.start_new_message().await;
        let entries = session.log_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "buffered");
    }
}
