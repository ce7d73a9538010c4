//! Orchestrator Service: the integrator that owns plans, tasks, and
//! live worker sessions, and wires the worktree manager, message router, and
//! completion engine together behind one external API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::completion::{CompletionEngine, CompletionError, MergeOptions};
use crate::error::{ErrorKind, TaxonomyError};
use crate::message::MessageContent;
use crate::queue::{MessageHandler, QueueError};
use crate::router::MessageRouter;
use crate::session::log::Role;
use crate::session::stream::StreamEvent;
use crate::session::{WorkerSession, WorkerSessionError};
use crate::state::SessionStatus;
use crate::turn_executor::{ToolInvoker, TurnExecutor};
use crate::worktree::{CompleteWorktreeOptions, CreateWorktreeOptions, WorktreeError, WorktreeManager};
use warden_store::models::{Plan, PlanStatus, Task, TaskStatus};
use warden_store::plan_store::{self, PlanStoreFile};
use warden_store::StoreError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no plan with id {0}")]
    PlanNotFound(Uuid),
    #[error("no task with id {0}")]
    TaskNotFound(Uuid),
    #[error("no worker with id {0}")]
    WorkerNotFound(Uuid),
    #[error("task {0} already has a live worker")]
    TaskAlreadyDeployed(Uuid),
    #[error("plan {plan_id} has status {status}, expected {expected}")]
    InvalidPlanStatus {
        plan_id: Uuid,
        status: PlanStatus,
        expected: &'static str,
    },
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Session(#[from] WorkerSessionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PlanParse(#[from] crate::plan::PlanParseError),
    #[error(transparent)]
    PlanValidation(#[from] crate::plan::ValidationError),
}

impl TaxonomyError for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::PlanNotFound(_)
            | OrchestratorError::TaskNotFound(_)
            | OrchestratorError::WorkerNotFound(_) => ErrorKind::NotFound,
            OrchestratorError::TaskAlreadyDeployed(_) => ErrorKind::Conflict,
            OrchestratorError::InvalidPlanStatus { .. } => ErrorKind::Validation,
            OrchestratorError::Worktree(e) => e.kind(),
            OrchestratorError::Completion(e) => e.kind(),
            OrchestratorError::Session(e) => e.kind(),
            OrchestratorError::Queue(e) => e.kind(),
            OrchestratorError::Store(_) => ErrorKind::TransientIo,
            OrchestratorError::PlanParse(e) => e.kind(),
            OrchestratorError::PlanValidation(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PlanCreated(Uuid),
    PlanStatusChanged { plan_id: Uuid, status: PlanStatus },
    TaskCreated(Uuid),
    TaskStatusChanged { task_id: Uuid, status: TaskStatus },
    WorkerDeployed { task_id: Uuid, worker_id: Uuid },
    WorkerStatusChanged { worker_id: Uuid, status: SessionStatus },
    WorkerRemoved { worker_id: Uuid },
}

/// Read-only view of a live worker, for `worker list`/`worker show` and the
/// HTTP surface — deliberately not the `WorkerHandle` itself, which owns
/// the semaphore permit and conversation task handle.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub worker_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub status: SessionStatus,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently live worker sessions across all plans.
    pub max_concurrent_workers: usize,
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 8,
            event_buffer: 1024,
        }
    }
}

/// Everything `deploy` needs that is specific to one task: the agent
/// identity and the external collaborators (the turn-executor and
/// tool-invocation seams) this task's conversation drives.
pub struct DeployOptions {
    pub agent_id: String,
    pub agent_instructions: Vec<String>,
    pub model_id: Option<String>,
    pub turn_executor: Arc<dyn TurnExecutor>,
    pub tool_invoker: Arc<dyn ToolInvoker>,
}

struct WorkerHandle {
    session: Arc<WorkerSession>,
    task_id: Uuid,
    /// Key into `WorktreeManager`'s registry — distinct from `session.id`
    /// since a worktree is allocated before the session exists.
    worktree_session_id: Uuid,
    _permit: OwnedSemaphorePermit,
    conversation: tokio::task::JoinHandle<()>,
}

/// Forwards queue messages addressed to a worker into that worker's
/// approval table / conversation log.
struct SessionMessageHandler {
    session: Arc<WorkerSession>,
}

#[async_trait::async_trait]
impl MessageHandler for SessionMessageHandler {
    async fn handle(&self, message: &crate::message::Message) -> anyhow::Result<()> {
        match &message.content {
            MessageContent::ApprovalResponse {
                approval_id,
                approved,
                clarification,
            } => {
                self.session
                    .handle_approval(*approval_id, *approved, clarification.clone())
                    .await?;
            }
            MessageContent::Cancellation { .. } => {
                self.session.interrupt().await?;
            }
            other => {
                self.session
                    .send_clarification(format!("{other:?}"))
                    .await;
            }
        }
        Ok(())
    }
}

pub struct OrchestratorService {
    clock: Arc<dyn Clock>,
    router: Arc<MessageRouter>,
    worktrees: Arc<WorktreeManager>,
    completion: Arc<CompletionEngine>,
    store_path: PathBuf,
    semaphore: Arc<Semaphore>,
    plans: Mutex<HashMap<Uuid, Plan>>,
    tasks: Mutex<HashMap<Uuid, Task>>,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorService {
    pub async fn load(
        clock: Arc<dyn Clock>,
        router: Arc<MessageRouter>,
        worktrees: Arc<WorktreeManager>,
        completion: Arc<CompletionEngine>,
        store_path: PathBuf,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let file: PlanStoreFile = plan_store::load(&store_path)?;
        let (events, _) = broadcast::channel(config.event_buffer);

        let mut tasks = file.tasks;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Running {
                warn!(task_id = %task.id, "resetting orphaned running task to pending on restart");
                task.status = TaskStatus::Pending;
            }
        }

        let service = Self {
            clock,
            router,
            worktrees,
            completion,
            store_path,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_workers)),
            plans: Mutex::new(file.plans),
            tasks: Mutex::new(tasks),
            workers: Mutex::new(HashMap::new()),
            events,
        };
        service.persist().await?;
        Ok(service)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self) -> Result<(), OrchestratorError> {
        let plans = self.plans.lock().await.clone();
        let tasks = self.tasks.lock().await.clone();
        plan_store::save(&self.store_path, &PlanStoreFile {
            schema_version: plan_store::SCHEMA_VERSION,
            plans,
            tasks,
        })?;
        Ok(())
    }

    // -- plans ---------------------------------------------------------

    pub async fn create_plan(
        &self,
        name: impl Into<String>,
        base_branch: impl Into<String>,
        token_budget: Option<i64>,
    ) -> Result<Plan, OrchestratorError> {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: name.into(),
            base_branch: base_branch.into(),
            token_budget,
            status: PlanStatus::New,
            created_at: self.clock.now(),
        };
        self.plans.lock().await.insert(plan.id, plan.clone());
        self.persist().await?;
        self.emit(OrchestratorEvent::PlanCreated(plan.id));
        Ok(plan)
    }

    /// Loads and materializes a `plan.toml` document, inserting the plan and
    /// all its tasks. On any validation failure, nothing is inserted.
    pub async fn load_plan_file(&self, content: &str) -> Result<(Plan, Vec<Task>), OrchestratorError> {
        let parsed = crate::plan::parse_plan_toml(content)?;
        let (plan, tasks) = crate::plan::materialize_plan(parsed)?;

        {
            let mut plans = self.plans.lock().await;
            let mut task_map = self.tasks.lock().await;
            plans.insert(plan.id, plan.clone());
            for task in &tasks {
                task_map.insert(task.id, task.clone());
            }
        }
        self.persist().await?;
        self.emit(OrchestratorEvent::PlanCreated(plan.id));
        for task in &tasks {
            self.emit(OrchestratorEvent::TaskCreated(task.id));
        }
        Ok((plan, tasks))
    }

    pub async fn get_plan(&self, id: Uuid) -> Option<Plan> {
        self.plans.lock().await.get(&id).cloned()
    }

    pub async fn list_plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.plans.lock().await.values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Adds a single task to an already-created plan. The bulk alternative,
    /// for plans built up incrementally rather than loaded whole from a
    /// `plan.toml` file.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        plan_id: Uuid,
        name: Option<String>,
        description: impl Into<String>,
        priority: warden_store::models::Priority,
        dependencies: Vec<Uuid>,
        target_files: Vec<String>,
        base_branch: Option<String>,
    ) -> Result<Task, OrchestratorError> {
        if self.plans.lock().await.get(&plan_id).is_none() {
            return Err(OrchestratorError::PlanNotFound(plan_id));
        }
        let task = Task {
            id: Uuid::new_v4(),
            name,
            description: description.into(),
            priority,
            plan_id: Some(plan_id),
            dependencies,
            parallel_group: None,
            agent: None,
            model_id: None,
            target_files,
            base_branch,
            worker_id: None,
            session_uri: None,
            status: TaskStatus::Pending,
            created_at: self.clock.now(),
        };
        self.tasks.lock().await.insert(task.id, task.clone());
        self.persist().await?;
        self.emit(OrchestratorEvent::TaskCreated(task.id));
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().await.get(&id).cloned()
    }

    pub async fn list_tasks(&self, plan_id: Uuid) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.plan_id == Some(plan_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    async fn set_plan_status(&self, plan_id: Uuid, status: PlanStatus) -> Result<(), OrchestratorError> {
        {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(&plan_id).ok_or(OrchestratorError::PlanNotFound(plan_id))?;
            plan.status = status;
        }
        self.persist().await?;
        self.emit(OrchestratorEvent::PlanStatusChanged { plan_id, status });
        Ok(())
    }

    pub async fn start_plan(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        self.set_plan_status(plan_id, PlanStatus::Running).await
    }

    pub async fn pause_plan(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        self.set_plan_status(plan_id, PlanStatus::Paused).await
    }

    pub async fn resume_plan(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        self.set_plan_status(plan_id, PlanStatus::Running).await
    }

    /// Tasks that are `Pending` and whose dependencies have all `Completed`.
    pub async fn ready_tasks(&self, plan_id: Uuid) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let by_plan: HashMap<Uuid, &Task> = tasks
            .values()
            .filter(|t| t.plan_id == Some(plan_id))
            .map(|t| (t.id, t))
            .collect();
        by_plan
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies.iter().all(|dep| {
                        by_plan
                            .get(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(true)
                    })
            })
            .map(|t| (*t).clone())
            .collect()
    }

    /// A plan is `Completed` once every task it owns is `Completed`;
    /// `Failed` once some task `Failed` and nothing remains runnable.
    async fn recompute_plan_status(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        let tasks = self.list_tasks(plan_id).await;
        if tasks.is_empty() {
            return Ok(());
        }
        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            self.set_plan_status(plan_id, PlanStatus::Completed).await?;
        } else if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            let ready = self.ready_tasks(plan_id).await;
            let any_running = tasks.iter().any(|t| t.status == TaskStatus::Running);
            if ready.is_empty() && !any_running {
                self.set_plan_status(plan_id, PlanStatus::Failed).await?;
            }
        }
        Ok(())
    }

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<Option<Uuid>, OrchestratorError> {
        let plan_id = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks.get_mut(&task_id).ok_or(OrchestratorError::TaskNotFound(task_id))?;
            task.status = status;
            task.plan_id
        };
        self.persist().await?;
        self.emit(OrchestratorEvent::TaskStatusChanged { task_id, status });
        Ok(plan_id)
    }

    // -- deploy / workers ------------------------------------------------

    pub async fn deploy(&self, task_id: Uuid, opts: DeployOptions) -> Result<Uuid, OrchestratorError> {
        if self.workers.lock().await.values().any(|w| w.task_id == task_id) {
            return Err(OrchestratorError::TaskAlreadyDeployed(task_id));
        }
        let task = self
            .tasks
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let session_id = Uuid::new_v4();
        let worktree = self
            .worktrees
            .create_worktree(session_id, CreateWorktreeOptions {
                base: task.base_branch.clone(),
                ..Default::default()
            })
            .await?;

        let session = Arc::new(WorkerSession::new(
            Arc::clone(&self.clock),
            task.name.clone().unwrap_or_else(|| task.id.to_string()),
            task.description.clone(),
            PathBuf::from(&worktree.worktree_path),
            opts.agent_id.clone(),
            task.plan_id,
            Some(worktree.base_branch.clone()),
        ));
        session
            .set_agent(opts.agent_id.clone(), opts.agent_instructions.clone())
            .await;
        if let Some(model_id) = &opts.model_id {
            session.set_model(model_id.clone()).await;
        }

        self.router
            .queue()
            .register_handler(opts.agent_id.clone(), Arc::new(SessionMessageHandler {
                session: Arc::clone(&session),
            }))
            .await;

        session.start().await?;
        self.set_task_status(task_id, TaskStatus::Running).await?;

        let conversation = tokio::spawn(drive_conversation(
            Arc::clone(&session),
            opts.turn_executor,
            opts.tool_invoker,
        ));

        let worker_id = session.id;
        self.workers.lock().await.insert(worker_id, WorkerHandle {
            session,
            task_id,
            worktree_session_id: session_id,
            _permit: permit,
            conversation,
        });

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(t) = tasks.get_mut(&task_id) {
                t.worker_id = Some(worker_id.to_string());
            }
        }
        self.persist().await?;
        self.emit(OrchestratorEvent::WorkerDeployed { task_id, worker_id });
        Ok(worker_id)
    }

    async fn worker(&self, worker_id: Uuid) -> Result<Arc<WorkerSession>, OrchestratorError> {
        self.workers
            .lock()
            .await
            .get(&worker_id)
            .map(|w| Arc::clone(&w.session))
            .ok_or(OrchestratorError::WorkerNotFound(worker_id))
    }

    async fn summarize(worker_id: Uuid, task_id: Uuid, session: &WorkerSession) -> WorkerSummary {
        WorkerSummary {
            worker_id,
            task_id,
            agent_id: session.agent_id().await,
            status: session.status().await,
            last_activity_at: session.last_activity_at().await,
        }
    }

    pub async fn list_workers(&self) -> Vec<WorkerSummary> {
        let workers = self.workers.lock().await;
        let mut summaries = Vec::with_capacity(workers.len());
        for (worker_id, handle) in workers.iter() {
            summaries.push(Self::summarize(*worker_id, handle.task_id, &handle.session).await);
        }
        summaries
    }

    pub async fn get_worker_summary(&self, worker_id: Uuid) -> Result<WorkerSummary, OrchestratorError> {
        let workers = self.workers.lock().await;
        let handle = workers
            .get(&worker_id)
            .ok_or(OrchestratorError::WorkerNotFound(worker_id))?;
        Ok(Self::summarize(worker_id, handle.task_id, &handle.session).await)
    }

    pub async fn worker_log(&self, worker_id: Uuid) -> Result<Vec<crate::session::log::LogEntry>, OrchestratorError> {
        let session = self.worker(worker_id).await?;
        Ok(session.log_entries().await)
    }

    /// Subscribe to a worker's response stream, for the HTTP surface's
    /// per-worker SSE endpoint.
    pub async fn subscribe_worker_stream(
        &self,
        worker_id: Uuid,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, OrchestratorError> {
        let session = self.worker(worker_id).await?;
        Ok(session.stream.subscribe(256).await)
    }

    pub async fn send_message(&self, worker_id: Uuid, text: impl Into<String>) -> Result<(), OrchestratorError> {
        let session = self.worker(worker_id).await?;
        session.send_clarification(text.into()).await;
        Ok(())
    }

    pub async fn approve(
        &self,
        worker_id: Uuid,
        approval_id: Uuid,
        approved: bool,
        clarification: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let session = self.worker(worker_id).await?;
        session.handle_approval(approval_id, approved, clarification).await?;
        self.emit(OrchestratorEvent::WorkerStatusChanged {
            worker_id,
            status: session.status().await,
        });
        Ok(())
    }

    pub async fn interrupt(&self, worker_id: Uuid) -> Result<(), OrchestratorError> {
        let session = self.worker(worker_id).await?;
        session.interrupt().await?;
        self.emit(OrchestratorEvent::WorkerStatusChanged {
            worker_id,
            status: session.status().await,
        });
        Ok(())
    }

    /// Marks a worker's task complete: commits any outstanding worktree
    /// changes, merges the worktree branch into its base branch, then
    /// releases the worktree. Merge conflicts do not fail completion — the
    /// task is still marked `Completed` and a warning is logged, since by
    /// the time an operator calls this the conversation is already over.
    pub async fn complete(&self, worker_id: Uuid) -> Result<(), OrchestratorError> {
        let (session, task_id, worktree_session_id) = {
            let workers = self.workers.lock().await;
            let handle = workers.get(&worker_id).ok_or(OrchestratorError::WorkerNotFound(worker_id))?;
            (Arc::clone(&handle.session), handle.task_id, handle.worktree_session_id)
        };
        session.complete().await?;
        self.finalize_worktree(worktree_session_id, task_id).await?;
        self.remove_worker(worker_id).await;
        let plan_id = self.set_task_status(task_id, TaskStatus::Completed).await?;
        if let Some(plan_id) = plan_id {
            self.recompute_plan_status(plan_id).await?;
        }
        self.emit(OrchestratorEvent::WorkerStatusChanged {
            worker_id,
            status: SessionStatus::Completed,
        });
        Ok(())
    }

    async fn finalize_worktree(&self, worktree_session_id: Uuid, task_id: Uuid) -> Result<(), OrchestratorError> {
        let Some(info) = self.worktrees.get(worktree_session_id).await else {
            return Ok(());
        };
        let repo = PathBuf::from(&info.repo_path);

        self.worktrees
            .complete_worktree(worktree_session_id, CompleteWorktreeOptions {
                commit_message: Some(format!("Complete task {task_id}")),
                ..Default::default()
            })
            .await?;

        let check = self.completion.pre_merge_check(&repo, &info.branch_name, &info.base_branch)?;
        let merged = if check.can_merge {
            let outcome = self.completion.merge_branches(
                &repo,
                &info.branch_name,
                &info.base_branch,
                MergeOptions::default(),
            )?;
            if !outcome.success {
                warn!(task_id = %task_id, branch = %info.branch_name, "merge reported conflicts, worktree left for manual resolution");
            }
            outcome.success
        } else {
            warn!(task_id = %task_id, branch = %info.branch_name, errors = ?check.errors, "skipping merge, pre-merge check failed");
            false
        };

        if merged {
            self.worktrees.remove_worktree(worktree_session_id).await?;
        }
        Ok(())
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        let worker_id = self
            .workers
            .lock()
            .await
            .iter()
            .find(|(_, w)| w.task_id == task_id)
            .map(|(id, _)| *id);

        if let Some(worker_id) = worker_id {
            if let Ok(session) = self.worker(worker_id).await {
                let _ = session.fail("cancelled by operator").await;
            }
            self.remove_worker(worker_id).await;
        }
        let plan_id = self.set_task_status(task_id, TaskStatus::Cancelled).await?;
        if let Some(plan_id) = plan_id {
            self.recompute_plan_status(plan_id).await?;
        }
        Ok(())
    }

    async fn remove_worker(&self, worker_id: Uuid) {
        if let Some(handle) = self.workers.lock().await.remove(&worker_id) {
            handle.conversation.abort();
        }
        self.emit(OrchestratorEvent::WorkerRemoved { worker_id });
    }

    /// All pending approvals across every live worker, for a global inbox
    /// view.
    pub async fn list_inbox(&self) -> Vec<(Uuid, crate::session::approval::ApprovalRequest)> {
        let workers = self.workers.lock().await;
        let mut inbox = Vec::new();
        for (worker_id, handle) in workers.iter() {
            for approval in handle.session.pending_approvals().await {
                inbox.push((*worker_id, approval));
            }
        }
        inbox
    }

    pub async fn process_inbox(
        &self,
        worker_id: Uuid,
        approval_id: Uuid,
        approved: bool,
    ) -> Result<(), OrchestratorError> {
        self.approve(worker_id, approval_id, approved, None).await
    }
}

/// Drives a worker's conversation loop against its turn executor until the
/// session reaches a terminal state or the executor reports it is done.
async fn drive_conversation(
    session: Arc<WorkerSession>,
    turn_executor: Arc<dyn TurnExecutor>,
    tool_invoker: Arc<dyn ToolInvoker>,
) {
    loop {
        if session.status().await.is_terminal() {
            break;
        }
        let cancel = session.cancellation_token().await;
        let conversation: Vec<String> = session
            .log_entries()
            .await
            .iter()
            .map(|entry| format!("{}: {}", role_label(entry.role), entry.content))
            .collect();

        let output = match turn_executor.run_turn(&conversation, cancel.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "turn executor failed");
                let _ = session.fail(e.to_string()).await;
                break;
            }
        };

        for event in output.stream_events {
            if let StreamEvent::StreamPart { text } = event {
                session.emit_stream_part(&text).await;
            }
        }

        for call in output.tool_calls {
            let approval_id = if call.requires_approval {
                match session
                    .request_approval(&call.tool_name, &call.tool_call_id, &call.tool_name, Value::Null)
                    .await
                {
                    Ok((id, rx)) => match rx.await {
                        Ok(decision) if decision.approved => Some(id),
                        _ => continue,
                    },
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "approval request failed");
                        continue;
                    }
                }
            } else {
                None
            };

            if let Err(e) = tool_invoker.invoke(&call, approval_id).await {
                warn!(session_id = %session.id, tool = %call.tool_name, error = %e, "tool invocation failed");
            }
        }

        session.start_new_message().await;

        if cancel.is_cancelled() {
            break;
        }
        if output.done {
            let _ = session.turn_done().await;
            break;
        }
    }
    info!(session_id = %session.id, "conversation loop exited");
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use warden_store::models::Priority;

    use crate::clock::FakeClock;
    use crate::git::SystemGitRunner;
    use crate::queue::{MessageQueue, QueueConfig};
    use crate::router::{MessageRouter, RouterConfig};
    use crate::turn_executor::{ToolCallRequest, ToolInvoker, TurnExecutor, TurnOutput};

    use super::*;

    struct Harness {
        _repo: TempDir,
        _store_dir: TempDir,
        service: OrchestratorService,
    }

    async fn harness() -> Harness {
        let repo = warden_test_utils::create_temp_repo();
        let store_dir = TempDir::new().expect("temp store dir");

        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let queue = MessageQueue::new(clock.clone(), QueueConfig::default());
        let router = MessageRouter::new(queue, clock.clone(), RouterConfig::default());
        let runner = Arc::new(SystemGitRunner);
        let worktrees = WorktreeManager::load(
            repo.path(),
            None,
            store_dir.path().join("worktrees.json"),
            runner.clone(),
        )
        .await
        .expect("load worktree manager");
        let completion = CompletionEngine::new(runner);

        let service = OrchestratorService::load(
            clock,
            router,
            Arc::new(worktrees),
            Arc::new(completion),
            store_dir.path().join("plans.json"),
            OrchestratorConfig::default(),
        )
        .await
        .expect("load orchestrator service");

        Harness {
            _repo: repo,
            _store_dir: store_dir,
            service,
        }
    }

    struct ImmediateDoneExecutor;

    #[async_trait]
    impl TurnExecutor for ImmediateDoneExecutor {
        async fn run_turn(
            &self,
            _conversation: &[String],
            _cancel: CancellationToken,
        ) -> anyhow::Result<TurnOutput> {
            Ok(TurnOutput {
                stream_events: vec![],
                tool_calls: vec![],
                done: true,
            })
        }
    }

    struct NoopToolInvoker;

    #[async_trait]
    impl ToolInvoker for NoopToolInvoker {
        async fn invoke(
            &self,
            _call: &ToolCallRequest,
            _approval_id: Option<Uuid>,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn create_task_requires_existing_plan() {
        let h = harness().await;
        let err = h
            .service
            .create_task(Uuid::new_v4(), None, "do it", Priority::Normal, vec![], vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn list_plans_reflects_created_plans() {
        let h = harness().await;
        h.service.create_plan("demo", "main", None).await.unwrap();
        h.service.create_plan("demo2", "main", None).await.unwrap();
        let plans = h.service.list_plans().await;
        assert_eq!(plans.len(), 2);
    }

    #[tokio::test]
    async fn deploy_then_complete_round_trip() {
        let h = harness().await;
        let plan = h.service.create_plan("demo", "main", None).await.unwrap();
        let task = h
            .service
            .create_task(plan.id, Some("t1".into()), "write a thing", Priority::Normal, vec![], vec![], None)
            .await
            .unwrap();

        let worker_id = h
            .service
            .deploy(task.id, DeployOptions {
                agent_id: "agent-1".into(),
                agent_instructions: vec!["be helpful".into()],
                model_id: None,
                turn_executor: Arc::new(ImmediateDoneExecutor),
                tool_invoker: Arc::new(NoopToolInvoker),
            })
            .await
            .unwrap();

        let summary = h.service.get_worker_summary(worker_id).await.unwrap();
        assert_eq!(summary.task_id, task.id);
        assert_eq!(summary.agent_id, "agent-1");

        let deployed = h.service.get_task(task.id).await.unwrap();
        assert_eq!(deployed.status, TaskStatus::Running);

        // Wait for the conversation loop to run the one turn and go idle.
        let mut waited = Duration::ZERO;
        loop {
            let status = h.service.get_worker_summary(worker_id).await.unwrap().status;
            if status == SessionStatus::Idle || waited >= Duration::from_secs(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        h.service.complete(worker_id).await.unwrap();
        assert!(h.service.get_worker_summary(worker_id).await.is_err());

        let finished = h.service.get_task(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);

        let plan_after = h.service.get_plan(plan.id).await.unwrap();
        assert_eq!(plan_after.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn deploy_twice_for_same_task_is_conflict() {
        let h = harness().await;
        let plan = h.service.create_plan("demo", "main", None).await.unwrap();
        let task = h
            .service
            .create_task(plan.id, None, "d", Priority::Normal, vec![], vec![], None)
            .await
            .unwrap();

        let opts = || DeployOptions {
            agent_id: "agent-1".into(),
            agent_instructions: vec![],
            model_id: None,
            turn_executor: Arc::new(ImmediateDoneExecutor),
            tool_invoker: Arc::new(NoopToolInvoker),
        };
        h.service.deploy(task.id, opts()).await.unwrap();
        let err = h.service.deploy(task.id, opts()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskAlreadyDeployed(_)));
    }

    #[tokio::test]
    async fn subscribe_worker_stream_for_unknown_worker_fails() {
        let h = harness().await;
        let err = h.service.subscribe_worker_stream(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerNotFound(_)));
    }

    #[tokio::test]
    async fn list_workers_includes_deployed_worker() {
        let h = harness().await;
        let plan = h.service.create_plan("demo", "main", None).await.unwrap();
        let task = h
            .service
            .create_task(plan.id, None, "d", Priority::Normal, vec![], vec![], None)
            .await
            .unwrap();
        let worker_id = h
            .service
            .deploy(task.id, DeployOptions {
                agent_id: "agent-1".into(),
                agent_instructions: vec![],
                model_id: None,
                turn_executor: Arc::new(ImmediateDoneExecutor),
                tool_invoker: Arc::new(NoopToolInvoker),
            })
            .await
            .unwrap();

        let workers = h.service.list_workers().await;
        assert!(workers.iter().any(|w| w.worker_id == worker_id));
    }
}
