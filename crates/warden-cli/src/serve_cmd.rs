//! `warden serve`: an HTTP/SSE surface over the orchestrator, restricted to
//! localhost and RFC1918 callers.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use warden_core::orchestrator::{DeployOptions, OrchestratorError, OrchestratorEvent, OrchestratorService};
use warden_core::session::stream::StreamEvent;
use warden_core::turn_executor::TurnExecutor;
use warden_store::models::Priority;

use crate::context::AppContext;
use crate::stub_executor::{NullToolInvoker, NullTurnExecutor};

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let status = StatusCode::from_u16(
            <OrchestratorError as warden_core::error::TaxonomyError>::kind(&err).http_status(),
        )
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::err(self.message))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Access control: localhost and RFC1918 only
// ---------------------------------------------------------------------------

fn is_allowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_private()),
    }
}

async fn access_control(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if is_allowed(addr.ip()) {
        next.run(req).await
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::<()>::err(
                "access restricted to localhost and private networks",
            )),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Router / entry point
// ---------------------------------------------------------------------------

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/chat", post(chat))
        .route("/api/orchestrator/plans", get(list_plans).post(create_plan))
        .route("/api/orchestrator/plans/{id}", get(get_plan))
        .route("/api/orchestrator/plans/{id}/start", post(start_plan))
        .route("/api/orchestrator/plans/{id}/pause", post(pause_plan))
        .route("/api/orchestrator/plans/{id}/resume", post(resume_plan))
        .route("/api/orchestrator/tasks", get(list_tasks).post(create_task))
        .route("/api/orchestrator/tasks/{id}", get(get_task))
        .route("/api/orchestrator/tasks/{id}/deploy", post(deploy_task))
        .route("/api/orchestrator/tasks/{id}/cancel", post(cancel_task))
        .route("/api/orchestrator/workers", get(list_workers))
        .route("/api/orchestrator/workers/{id}", get(get_worker))
        .route("/api/orchestrator/workers/{id}/message", post(message_worker))
        .route("/api/orchestrator/workers/{id}/approve", post(approve_worker))
        .route("/api/orchestrator/workers/{id}/complete", post(complete_worker))
        .route("/api/orchestrator/workers/{id}/interrupt", post(interrupt_worker))
        .route("/api/orchestrator/workers/{id}/stream", get(worker_stream))
        .route("/api/orchestrator/inbox", get(list_inbox).post(process_inbox))
        .route("/api/orchestrator/events", get(global_events))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/recent", get(list_workspaces))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(middleware::from_fn(access_control))
        .with_state(ctx)
}

pub async fn run_serve(ctx: Arc<AppContext>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(ctx);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("warden serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    tracing::info!("warden serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(ApiResponse::ok(serde_json::json!({ "status": "ok" })))
}

#[derive(Serialize)]
struct StatusResponse {
    plans: usize,
    workers: usize,
    repo_path: String,
}

async fn status(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let plans = ctx.orchestrator.list_plans().await.len();
    let workers = ctx.orchestrator.list_workers().await.len();
    Json(ApiResponse::ok(StatusResponse {
        plans,
        workers,
        repo_path: ctx.config.repo_path.display().to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Chat (SSE)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn chat(Json(req): Json<ChatRequest>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let executor = NullTurnExecutor;
        match executor.run_turn(&[req.message], CancellationToken::new()).await {
            Ok(output) => {
                for event in output.stream_events {
                    if let StreamEvent::StreamPart { text } = event {
                        yield Ok(Event::default().event("message").json_data(serde_json::json!({ "text": text })).unwrap());
                    }
                }
            }
            Err(e) => {
                yield Ok(Event::default().event("error").data(e.to_string()));
            }
        }
        yield Ok(Event::default().event("done").data("{}"));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

async fn list_plans(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ApiResponse::ok(ctx.orchestrator.list_plans().await))
}

#[derive(Deserialize)]
struct CreatePlanRequest {
    toml: String,
}

async fn create_plan(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (plan, _tasks) = ctx.orchestrator.load_plan_file(&req.toml).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(plan))))
}

async fn get_plan(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let plan = ctx
        .orchestrator
        .get_plan(id)
        .await
        .ok_or(OrchestratorError::PlanNotFound(id))?;
    Ok(Json(ApiResponse::ok(plan)))
}

async fn start_plan(State(ctx): State<Arc<AppContext>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.start_plan(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

async fn pause_plan(State(ctx): State<Arc<AppContext>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.pause_plan(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

async fn resume_plan(State(ctx): State<Arc<AppContext>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.resume_plan(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListTasksQuery {
    plan_id: Uuid,
}

async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<ListTasksQuery>,
) -> impl IntoResponse {
    Json(ApiResponse::ok(ctx.orchestrator.list_tasks(q.plan_id).await))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    plan_id: Uuid,
    name: Option<String>,
    description: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    dependencies: Vec<Uuid>,
    #[serde(default)]
    target_files: Vec<String>,
    base_branch: Option<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

async fn create_task(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let priority: Priority = req
        .priority
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid priority: {:?}", req.priority)))?;
    let task = ctx
        .orchestrator
        .create_task(
            req.plan_id,
            req.name,
            req.description,
            priority,
            req.dependencies,
            req.target_files,
            req.base_branch,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(task))))
}

async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = ctx
        .orchestrator
        .get_task(id)
        .await
        .ok_or(OrchestratorError::TaskNotFound(id))?;
    Ok(Json(ApiResponse::ok(task)))
}

#[derive(Deserialize)]
struct DeployTaskRequest {
    #[serde(default = "default_agent_id")]
    agent_id: String,
    model_id: Option<String>,
}

fn default_agent_id() -> String {
    "agent".to_string()
}

async fn deploy_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(req): Json<DeployTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let worker_id = ctx
        .orchestrator
        .deploy(
            id,
            DeployOptions {
                agent_id: req.agent_id,
                agent_instructions: Vec::new(),
                model_id: req.model_id,
                turn_executor: Arc::new(NullTurnExecutor),
                tool_invoker: Arc::new(NullToolInvoker),
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(serde_json::json!({ "worker_id": worker_id }))),
    ))
}

async fn cancel_task(State(ctx): State<Arc<AppContext>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.cancel_task(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn list_workers(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let workers: Vec<_> = ctx
        .orchestrator
        .list_workers()
        .await
        .into_iter()
        .map(WorkerSummaryResponse::from)
        .collect();
    Json(ApiResponse::ok(workers))
}

#[derive(Serialize)]
struct WorkerSummaryResponse {
    worker_id: Uuid,
    task_id: Uuid,
    agent_id: String,
    status: String,
    last_activity_at: chrono::DateTime<chrono::Utc>,
}

impl From<warden_core::orchestrator::WorkerSummary> for WorkerSummaryResponse {
    fn from(s: warden_core::orchestrator::WorkerSummary) -> Self {
        Self {
            worker_id: s.worker_id,
            task_id: s.task_id,
            agent_id: s.agent_id,
            status: s.status.to_string(),
            last_activity_at: s.last_activity_at,
        }
    }
}

async fn get_worker(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let summary = ctx.orchestrator.get_worker_summary(id).await?;
    let log = ctx.orchestrator.worker_log(id).await?;
    Ok(Json(ApiResponse::ok(serde_json::json!({
        "worker": WorkerSummaryResponse::from(summary),
        "log": log,
    }))))
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
}

async fn message_worker(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.send_message(id, req.text).await?;
    Ok(Json(ApiResponse::ok(())))
}

#[derive(Deserialize)]
struct ApproveRequest {
    approval_id: Uuid,
    approved: bool,
    clarification: Option<String>,
}

async fn approve_worker(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator
        .approve(id, req.approval_id, req.approved, req.clarification)
        .await?;
    Ok(Json(ApiResponse::ok(())))
}

async fn complete_worker(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.complete(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

async fn interrupt_worker(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.interrupt(id).await?;
    Ok(Json(ApiResponse::ok(())))
}

fn stream_event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::StreamStart => "stream_start",
        StreamEvent::StreamPart { .. } => "stream_part",
        StreamEvent::StreamEnd => "stream_end",
        StreamEvent::Warning { .. } => "warning",
    }
}

/// Merges a worker's response-stream parts with the orchestrator-wide event
/// broadcast (filtered to this worker) into one SSE stream: an initial
/// `state` snapshot, `update`s as the worker's status changes, the
/// response stream's own `stream_part`/`stream_end` events, and a final
/// `removed` once the worker is torn down.
async fn worker_stream(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let summary = ctx.orchestrator.get_worker_summary(id).await?;
    let mut parts_rx = ctx.orchestrator.subscribe_worker_stream(id).await?;
    let mut events_rx = ctx.orchestrator.subscribe_events();

    let state_payload = serde_json::json!({
        "worker_id": summary.worker_id,
        "task_id": summary.task_id,
        "agent_id": summary.agent_id,
        "status": summary.status.to_string(),
        "last_activity_at": summary.last_activity_at,
    });

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("state").data(state_payload.to_string()));
        loop {
            tokio::select! {
                part = parts_rx.recv() => {
                    match part {
                        Some(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                yield Ok(Event::default().event(stream_event_name(&event)).data(json));
                            }
                        }
                        None => break,
                    }
                }
                received = events_rx.recv() => {
                    match received {
                        Ok(OrchestratorEvent::WorkerStatusChanged { worker_id, status }) if worker_id == id => {
                            let payload = serde_json::json!({ "worker_id": worker_id, "status": status.to_string() });
                            yield Ok(Event::default().event("update").data(payload.to_string()));
                        }
                        Ok(OrchestratorEvent::WorkerRemoved { worker_id }) if worker_id == id => {
                            let payload = serde_json::json!({ "worker_id": worker_id });
                            yield Ok(Event::default().event("removed").data(payload.to_string()));
                            break;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct InboxEntry {
    worker_id: Uuid,
    approval_id: Uuid,
    tool_name: String,
    description: String,
}

async fn list_inbox(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let inbox: Vec<InboxEntry> = ctx
        .orchestrator
        .list_inbox()
        .await
        .into_iter()
        .map(|(worker_id, approval)| InboxEntry {
            worker_id,
            approval_id: approval.id,
            tool_name: approval.tool_name,
            description: approval.description,
        })
        .collect();
    Json(ApiResponse::ok(inbox))
}

#[derive(Deserialize)]
struct ProcessInboxRequest {
    worker_id: Uuid,
    approval_id: Uuid,
    approved: bool,
}

async fn process_inbox(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<ProcessInboxRequest>,
) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator
        .process_inbox(req.worker_id, req.approval_id, req.approved)
        .await?;
    Ok(Json(ApiResponse::ok(())))
}

// ---------------------------------------------------------------------------
// Global events (SSE)
// ---------------------------------------------------------------------------

fn event_payload(event: OrchestratorEvent) -> serde_json::Value {
    match event {
        OrchestratorEvent::PlanCreated(id) => serde_json::json!({ "kind": "plan_created", "plan_id": id }),
        OrchestratorEvent::PlanStatusChanged { plan_id, status } => {
            serde_json::json!({ "kind": "plan_status_changed", "plan_id": plan_id, "status": status.to_string() })
        }
        OrchestratorEvent::TaskCreated(id) => serde_json::json!({ "kind": "task_created", "task_id": id }),
        OrchestratorEvent::TaskStatusChanged { task_id, status } => {
            serde_json::json!({ "kind": "task_status_changed", "task_id": task_id, "status": status.to_string() })
        }
        OrchestratorEvent::WorkerDeployed { task_id, worker_id } => {
            serde_json::json!({ "kind": "worker_deployed", "task_id": task_id, "worker_id": worker_id })
        }
        OrchestratorEvent::WorkerStatusChanged { worker_id, status } => {
            serde_json::json!({ "kind": "worker_status_changed", "worker_id": worker_id, "status": status.to_string() })
        }
        OrchestratorEvent::WorkerRemoved { worker_id } => {
            serde_json::json!({ "kind": "worker_removed", "worker_id": worker_id })
        }
    }
}

async fn global_events(
    State(ctx): State<Arc<AppContext>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = ctx.orchestrator.subscribe_events();
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));
        let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
        heartbeat.tick().await;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Ok(event) => yield Ok(Event::default().event("orchestrator").data(event_payload(event).to_string())),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WorkspaceResponse {
    path: String,
}

async fn list_workspaces(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ApiResponse::ok(vec![WorkspaceResponse {
        path: ctx.config.repo_path.display().to_string(),
    }]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use crate::config::WardenConfig;

    use super::*;

    async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        std::process::Command::new("git")
            .args(["init", "--initial-branch=main"])
            .current_dir(dir.path())
            .output()
            .ok();
        let config = WardenConfig {
            repo_path: dir.path().to_path_buf(),
            worktree_base: None,
            queue_state_path: dir.path().join(".warden/queue.json"),
            plan_store_path: dir.path().join(".warden/plans.json"),
            worktree_registry_path: dir.path().join(".warden/worktrees.json"),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            default_ttl_ms: 300_000,
            default_retry_count: 3,
        };
        let ctx = Arc::new(AppContext::build(&config).await.unwrap());
        (ctx, dir)
    }

    async fn send(router: Router, uri: &str) -> Response {
        let req = HttpRequest::builder().uri(uri).body(Body::empty()).unwrap();
        router.oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (ctx, _dir) = test_ctx().await;
        let router = Router::new()
            .route("/api/health", get(health))
            .with_state(ctx);
        let resp = send(router, "/api/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_plans_empty_by_default() {
        let (ctx, _dir) = test_ctx().await;
        let router = Router::new()
            .route("/api/orchestrator/plans", get(list_plans))
            .with_state(ctx);
        let resp = send(router, "/api/orchestrator/plans").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[test]
    fn loopback_and_private_addresses_are_allowed() {
        assert!(is_allowed(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_allowed(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))));
        assert!(is_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!is_allowed(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }
}
