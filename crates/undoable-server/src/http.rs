use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use undoable_core::settings::{AdmissionBlocked, AdmissionKind};
use undoable_core::TurnRequest;
use undoable_swarm::NodeInput;
use undoable_types::{
    ApprovalMode, Attachment, ChatFrame, DaemonSettingsPatch, FireReason, JobPatch,
    OperationMode, OrchestrationOptions, RunConfig, RunStatus, Schedule, ScheduledJob,
    UndoStepResult, WorkflowEdge,
};

use crate::{AppState, ChatNodeStarter};

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let body_limit_mb = std::env::var("UNDOABLE_BODY_LIMIT_MB")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16);

    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/apply", post(apply_run))
        .route("/runs/{id}/undo", post(undo_run))
        .route("/chat", post(chat))
        .route("/chat/approve", post(chat_approve))
        .route(
            "/chat/approval-mode",
            get(get_approval_mode).post(set_approval_mode),
        )
        .route("/chat/run-config", get(get_run_config).post(set_run_config))
        .route("/chat/undo", post(chat_undo))
        .route("/chat/allow-once", post(chat_allow_once))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/jobs", get(list_jobs).post(create_job))
        .route(
            "/jobs/{id}",
            axum::routing::patch(patch_job).delete(delete_job),
        )
        .route("/jobs/{id}/run", post(run_job))
        .route("/jobs/status", get(jobs_status))
        .route("/jobs/history/undo", post(jobs_history_undo))
        .route("/jobs/history/redo", post(jobs_history_redo))
        .route(
            "/swarm/workflows",
            get(list_workflows).post(create_workflow),
        )
        .route(
            "/swarm/workflows/{id}",
            get(get_workflow).delete(delete_workflow),
        )
        .route("/swarm/workflows/{id}/nodes", post(add_node))
        .route(
            "/swarm/workflows/{id}/nodes/{node_id}",
            delete(remove_node),
        )
        .route("/swarm/workflows/{id}/edges", post(set_edges))
        .route("/swarm/workflows/{id}/execute", post(execute_workflow))
        .route(
            "/swarm/workflows/{id}/orchestrations",
            get(list_orchestrations),
        )
        .route("/swarm/orchestrations/{id}", get(get_orchestration))
        .route(
            "/settings/daemon",
            get(get_settings).patch(patch_settings),
        )
        .route(
            "/control/operation",
            get(get_operation).patch(patch_operation),
        )
        .route("/skills", get(list_skills))
        .route("/skills/{name}/enable", post(enable_skill))
        .route("/skills/{name}/disable", post(disable_skill))
        .route(
            "/instructions/{agent}",
            get(get_instructions).post(publish_instructions),
        )
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .layer(DefaultBodyLimit::max(body_limit_mb * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError(StatusCode, String);

type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

fn bad_request(err: impl std::fmt::Display) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, err.to_string())
}

fn not_found(what: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("{what} not found"))
}

fn blocked(err: AdmissionBlocked) -> ApiError {
    ApiError(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

async fn bearer_auth(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let effective = state.settings.effective();
    let needs_auth = matches!(effective.auth_mode, undoable_types::AuthMode::Token)
        && request.uri().path() != "/health";
    if needs_auth {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let expected = effective.token.as_deref().unwrap_or_default();
        if expected.is_empty() || presented != Some(expected) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing or invalid bearer token"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let scheduler = state.scheduler.status().await;
    Json(json!({
        "ready": true,
        "checks": {
            "runs": state.runs.list(None).len(),
            "scheduler": {"jobs": scheduler.jobs, "inFlight": scheduler.in_flight},
            "operationMode": state.settings.operation_mode().await.0,
        }
    }))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(rename = "runId")]
    run_id: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let feed = BroadcastStream::new(state.bus.subscribe_feed());
    let run_filter = query.run_id;
    let stream = feed.filter_map(move |item| {
        let run_filter = run_filter.clone();
        async move {
            let envelope = item.ok()?;
            if let Some(run_id) = run_filter {
                if envelope.run_id != run_id {
                    return None;
                }
            }
            let payload = serde_json::to_string(&envelope).ok()?;
            Some(Ok(Event::default().data(payload)))
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest {
    instruction: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<Json<Value>> {
    state
        .settings
        .admit(AdmissionKind::NewRun)
        .await
        .map_err(blocked)?;
    if req.instruction.trim().is_empty() {
        return Err(bad_request("instruction must not be empty"));
    }
    let run = state.spawn_instruction_run(req.instruction, req.agent_id, req.user_id, None);
    Ok(Json(json!({"run": run})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<Value> {
    let runs = match query.job_id {
        Some(job_id) => state.runs.list_by_job_id(&job_id),
        None => state.runs.list(query.user_id.as_deref()),
    };
    Json(json!({"runs": runs}))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = state.runs.get(&id).ok_or_else(|| not_found("run"))?;
    let events = state.runs.get_events(&id);
    Ok(Json(json!({"run": run, "events": events})))
}

async fn delete_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if state.runs.delete(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("run"))
    }
}

async fn pause_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = state.runs.set_paused(&id, true).map_err(bad_request)?;
    Ok(Json(json!({"run": run})))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = state.runs.set_paused(&id, false).map_err(bad_request)?;
    Ok(Json(json!({"run": run})))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = state.runs.get(&id).ok_or_else(|| not_found("run"))?;
    let had_loop = state.cancellations.cancel(&id).await;
    if !had_loop && !run.status.is_terminal() {
        state
            .runs
            .update_status(&id, RunStatus::Cancelled, None)
            .map_err(bad_request)?;
    }
    Ok(Json(json!({"cancelled": true})))
}

async fn apply_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = state
        .runs
        .advance_to(&id, RunStatus::Applying)
        .map_err(bad_request)?;
    Ok(Json(json!({"run": run})))
}

async fn undo_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = state.runs.get(&id).ok_or_else(|| not_found("run"))?;
    if run.status == RunStatus::Completed {
        state
            .runs
            .update_status(&id, RunStatus::Undoing, None)
            .map_err(bad_request)?;
    }
    let targets = state
        .undo
        .log()
        .list_undoable()
        .await
        .into_iter()
        .filter(|record| record.run_id.as_deref() == Some(id.as_str()))
        .collect::<Vec<_>>();
    let mut results: Vec<UndoStepResult> = Vec::new();
    for record in targets {
        let result = state.undo.undo_action(&record.id).await;
        let failed = !result.ok;
        results.push(result);
        if failed {
            break;
        }
    }
    let all_ok = results.iter().all(|r| r.ok);
    if state.runs.get(&id).map(|r| r.status) == Some(RunStatus::Undoing) {
        let terminal = if all_ok {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let _ = state.runs.update_status(&id, terminal, None);
    }
    Ok(Json(json!({"results": results})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

/// SSE of one chat turn: each envelope as `data: <json>`, closed by
/// `data: [DONE]`.
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>> {
    state
        .settings
        .admit(AdmissionKind::NewRun)
        .await
        .map_err(blocked)?;
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let run = state.runs.create(undoable_types::RunInput {
        user_id: "local".to_string(),
        agent_id: req.agent_id.clone().unwrap_or_else(|| "default".to_string()),
        instruction: req.message.clone(),
        job_id: None,
    });
    if let Err(active) = state
        .run_registry
        .acquire(&session_id, run.id.clone())
        .await
    {
        let _ = state.runs.delete(&run.id);
        return Err(ApiError(
            StatusCode::CONFLICT,
            format!(
                "session `{session_id}` already has an active run {}",
                active.run_id
            ),
        ));
    }

    let (sink, frames) = mpsc::unbounded_channel::<ChatFrame>();
    let turn_state = state.clone();
    let run_id = run.id.clone();
    let request = TurnRequest {
        session_id: session_id.clone(),
        run_id: run_id.clone(),
        message: req.message,
        attachments: req.attachments,
        agent_id: req.agent_id,
    };
    tokio::spawn(async move {
        let cancel = turn_state.cancellations.create(&run_id).await;
        if let Err(err) = turn_state.chat.run_turn(request, sink, cancel).await {
            tracing::warn!(run_id, error = %err, "chat turn failed");
        }
        turn_state.cancellations.remove(&run_id).await;
        turn_state.run_registry.release(&session_id, &run_id).await;
    });

    let stream = UnboundedReceiverStream::new(frames)
        .map(|frame| {
            let payload = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
            Ok::<_, std::convert::Infallible>(Event::default().data(payload))
        })
        .chain(stream::once(async {
            Ok::<_, std::convert::Infallible>(Event::default().data("[DONE]"))
        }));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    id: String,
    approved: bool,
    #[serde(default)]
    allow_always: bool,
}

async fn chat_approve(
    State(state): State<AppState>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<Value>> {
    let resolved = state
        .gate
        .resolve(&req.id, req.approved, req.allow_always)
        .await;
    if !resolved {
        return Err(not_found("approval request"));
    }
    Ok(Json(json!({"resolved": true})))
}

async fn get_approval_mode(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"mode": state.gate.mode().await}))
}

#[derive(Deserialize)]
struct ApprovalModeRequest {
    mode: ApprovalMode,
}

async fn set_approval_mode(
    State(state): State<AppState>,
    Json(req): Json<ApprovalModeRequest>,
) -> Json<Value> {
    state.gate.set_mode(req.mode).await;
    Json(json!({"mode": req.mode}))
}

async fn get_run_config(State(state): State<AppState>) -> Json<RunConfig> {
    Json(state.run_config.get().await)
}

async fn set_run_config(
    State(state): State<AppState>,
    Json(config): Json<RunConfig>,
) -> Json<RunConfig> {
    // The gate is the live enforcement point for the approval mode.
    state.gate.set_mode(config.approval_mode).await;
    state.run_config.set(config.clone()).await;
    Json(config)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUndoRequest {
    action: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    count: Option<usize>,
}

async fn chat_undo(
    State(state): State<AppState>,
    Json(req): Json<ChatUndoRequest>,
) -> ApiResult<Json<Value>> {
    match req.action.as_str() {
        "list" => Ok(Json(json!({
            "undoable": state.undo.log().list_undoable().await,
            "redoable": state.undo.log().list_redoable().await,
            "nonUndoable": state.undo.log().list_non_undoable_recent(50).await,
        }))),
        "one" => {
            let id = req.id.ok_or_else(|| bad_request("`id` is required"))?;
            let result = state.undo.undo_action(&id).await;
            Ok(Json(json!({"results": [result]})))
        }
        "last" => {
            let count = req.count.unwrap_or(1);
            let results = state.undo.undo_last_n(count).await;
            Ok(Json(json!({"results": results})))
        }
        "all" => {
            let results = state.undo.undo_all().await;
            Ok(Json(json!({"results": results})))
        }
        "redo" => {
            let results = state
                .undo
                .redo_last()
                .await
                .map(|r| vec![r])
                .unwrap_or_default();
            Ok(Json(json!({"results": results})))
        }
        other => Err(bad_request(format!("unknown undo action `{other}`"))),
    }
}

#[derive(Deserialize)]
struct AllowOnceRequest {
    tool: String,
}

async fn chat_allow_once(
    State(state): State<AppState>,
    Json(req): Json<AllowOnceRequest>,
) -> Json<Value> {
    state.pipeline.guard().allow_once(&req.tool).await;
    Json(json!({"tool": req.tool, "allowOnce": true}))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state
        .sessions
        .list()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "title": s.title,
                "messages": s.messages.len(),
                "createdAt": s.created_at,
                "updatedAt": s.updated_at,
            })
        })
        .collect::<Vec<_>>();
    Json(json!({"sessions": sessions}))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| not_found("session"))?;
    Ok(Json(json!({"session": session})))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.sessions.delete(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("session"))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsQuery {
    #[serde(default)]
    include_disabled: bool,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Json<Value> {
    Json(json!({"jobs": state.scheduler.list(query.include_disabled).await}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    schedule: Schedule,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    delete_after_run: Option<bool>,
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Json<Value>> {
    state
        .settings
        .admit(AdmissionKind::NewJob)
        .await
        .map_err(blocked)?;
    let mut job = ScheduledJob::new(req.name, req.schedule, req.payload.unwrap_or(json!({})));
    job.description = req.description;
    if let Some(enabled) = req.enabled {
        job.enabled = enabled;
    }
    if let Some(delete_after_run) = req.delete_after_run {
        job.delete_after_run = delete_after_run;
    }
    let job = state.scheduler.add(job).await.map_err(bad_request)?;
    Ok(Json(json!({"job": job})))
}

async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> ApiResult<Json<Value>> {
    let job = state
        .scheduler
        .update(&id, patch)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"job": job})))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.scheduler.remove(&id).await.map_err(|_| not_found("job"))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RunJobRequest {
    #[serde(default)]
    mode: Option<FireReason>,
}

async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Option<Json<RunJobRequest>>,
) -> ApiResult<Json<Value>> {
    state
        .settings
        .admit(AdmissionKind::Dispatch)
        .await
        .map_err(blocked)?;
    let mode = req
        .and_then(|Json(req)| req.mode)
        .unwrap_or(FireReason::Force);
    let fired = state.scheduler.run(&id, mode).await.map_err(bad_request)?;
    Ok(Json(json!({"fired": fired})))
}

async fn jobs_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": state.scheduler.status().await}))
}

async fn jobs_history_undo(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let undone = state.scheduler.undo_last().await.map_err(bad_request)?;
    Ok(Json(json!({"undone": undone})))
}

async fn jobs_history_redo(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let redone = state.scheduler.redo_last().await.map_err(bad_request)?;
    Ok(Json(json!({"redone": redone})))
}

async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"workflows": state.swarm.list_workflows().await}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkflowRequest {
    name: String,
    #[serde(default)]
    orchestrator_agent_id: Option<String>,
    #[serde(default)]
    workspace_dir: Option<String>,
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<Json<Value>> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let workspace_dir = req.workspace_dir.unwrap_or_else(|| {
        state
            .swarm
            .workspace_root()
            .join(Uuid::new_v4().to_string())
            .display()
            .to_string()
    });
    let workflow = state
        .swarm
        .create_workflow(
            req.name,
            req.orchestrator_agent_id
                .unwrap_or_else(|| "default".to_string()),
            workspace_dir,
        )
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"workflow": workflow})))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .swarm
        .get_workflow(&id)
        .await
        .ok_or_else(|| not_found("workflow"))?;
    Ok(Json(json!({"workflow": workflow})))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.swarm.delete_workflow(&id).await.map_err(bad_request)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("workflow"))
    }
}

async fn add_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<NodeInput>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .swarm
        .add_node(&id, input)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"workflow": workflow})))
}

async fn remove_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .swarm
        .remove_node(&id, &node_id)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"workflow": workflow})))
}

async fn set_edges(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(edges): Json<Vec<WorkflowEdge>>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .swarm
        .set_edges(&id, edges)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"workflow": workflow})))
}

async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    options: Option<Json<OrchestrationOptions>>,
) -> ApiResult<Json<Value>> {
    state
        .settings
        .admit(AdmissionKind::NewRun)
        .await
        .map_err(blocked)?;
    let starter = Arc::new(ChatNodeStarter {
        state: state.clone(),
    });
    let orchestration_id = state
        .swarm
        .execute(
            &id,
            options.map(|Json(options)| options).unwrap_or_default(),
            starter,
        )
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"orchestrationId": orchestration_id})))
}

async fn list_orchestrations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    Json(json!({"orchestrations": state.swarm.list_orchestrations(Some(&id)).await}))
}

async fn get_orchestration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let orchestration = state
        .swarm
        .get_orchestration(&id)
        .await
        .ok_or_else(|| not_found("orchestration"))?;
    Ok(Json(json!({"orchestration": orchestration})))
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"settings": state.settings.snapshot().await}))
}

async fn patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<DaemonSettingsPatch>,
) -> ApiResult<Json<Value>> {
    let snapshot = state
        .settings
        .apply_patch(patch)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"settings": snapshot})))
}

async fn get_operation(State(state): State<AppState>) -> Json<Value> {
    let (mode, reason) = state.settings.operation_mode().await;
    Json(json!({"operationMode": mode, "operationReason": reason}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationPatch {
    operation_mode: OperationMode,
    #[serde(default)]
    operation_reason: Option<String>,
}

async fn patch_operation(
    State(state): State<AppState>,
    Json(patch): Json<OperationPatch>,
) -> ApiResult<Json<Value>> {
    let snapshot = state
        .settings
        .apply_patch(DaemonSettingsPatch {
            operation_mode: Some(patch.operation_mode),
            operation_reason: patch.operation_reason,
            ..Default::default()
        })
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({
        "operationMode": snapshot.desired.operation_mode,
        "operationReason": snapshot.desired.operation_reason,
    })))
}

async fn list_skills(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"disabled": state.skills.disabled().await}))
}

async fn enable_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .skills
        .set_enabled(&name, true)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"skill": name, "enabled": true})))
}

async fn disable_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .skills
        .set_enabled(&name, false)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"skill": name, "enabled": false})))
}

async fn get_instructions(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<Value>> {
    let meta = state
        .instructions
        .meta(&agent)
        .await
        .ok_or_else(|| not_found("instructions"))?;
    let content = state.instructions.active(&agent).await.unwrap_or_default();
    Ok(Json(json!({"meta": meta, "content": content})))
}

#[derive(Deserialize)]
struct PublishInstructionsRequest {
    content: String,
}

async fn publish_instructions(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(req): Json<PublishInstructionsRequest>,
) -> ApiResult<Json<Value>> {
    let meta = state
        .instructions
        .publish(&agent, &req.content)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"meta": meta})))
}
