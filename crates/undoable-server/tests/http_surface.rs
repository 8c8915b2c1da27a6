use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use undoable_core::{
    ActionLog, ActionPipeline, ApprovalGate, CancellationRegistry, ChatLoop, EventBus,
    InstructionsStore, RunConfigStore, RunManager, SessionStore, SettingsService, SkillStore,
    UndoGuard, UndoService,
};
use undoable_providers::{ProviderRegistry, ScriptedProvider};
use undoable_scheduler::Scheduler;
use undoable_server::{app_router, AppState};
use undoable_swarm::SwarmService;
use undoable_tools::ToolRegistry;
use undoable_types::{ApprovalMode, SecurityPolicy};

async fn state(dir: &std::path::Path, token: Option<&str>) -> AppState {
    // Seed the settings file instead of touching process-wide env vars.
    if let Some(token) = token {
        std::fs::write(
            dir.join("daemon-settings.json"),
            json!({
                "version": 1,
                "host": "127.0.0.1",
                "port": 4477,
                "bindMode": "loopback",
                "authMode": "token",
                "token": token,
                "securityPolicy": "balanced",
                "operationMode": "normal",
            })
            .to_string(),
        )
        .unwrap();
    }
    let settings = SettingsService::load(dir.join("daemon-settings.json"))
        .await
        .unwrap();
    let bus = EventBus::new();
    let runs = RunManager::load(dir.join("runs-state.json"), bus.clone())
        .await
        .unwrap();
    let sessions = SessionStore::load(dir.join("sessions.json")).await.unwrap();
    let providers = ProviderRegistry::with_provider(Arc::new(ScriptedProvider::text_reply("ok")));
    let tools = ToolRegistry::with_builtins();
    let gate = ApprovalGate::new(bus.clone(), ApprovalMode::Off);
    let log = ActionLog::new();
    let pipeline = ActionPipeline::new(
        tools.clone(),
        log.clone(),
        gate.clone(),
        bus.clone(),
        UndoGuard::from_policy(SecurityPolicy::Balanced, false),
    );
    let undo = UndoService::new(log, tools);
    let run_config = RunConfigStore::with(Default::default());
    let chat = ChatLoop::new(
        sessions.clone(),
        providers.clone(),
        pipeline.clone(),
        runs.clone(),
        run_config.clone(),
    );
    let scheduler = Scheduler::load(dir.join("jobs-state.json")).await.unwrap();
    let swarm = SwarmService::load(dir.join("swarm-state.json"), runs.clone(), scheduler.clone())
        .await
        .unwrap();
    AppState {
        bus,
        runs,
        sessions,
        providers,
        pipeline,
        gate,
        undo,
        chat,
        scheduler,
        swarm,
        settings,
        run_config,
        instructions: InstructionsStore::new(dir.join("instructions")),
        skills: SkillStore::load(dir.join("skills.json")).await,
        cancellations: CancellationRegistry::new(),
        run_registry: undoable_server::RunRegistry::new(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ready() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ready"], true);
    assert!(body["checks"].is_object());
}

#[tokio::test]
async fn token_auth_guards_everything_but_health() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), Some("sekrit")).await);

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.clone().oneshot(get("/runs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/runs")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/runs")
        .header(header::AUTHORIZATION, "Bearer sekrit")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(right).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn jobs_crud_and_history_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);

    let response = router
        .clone()
        .oneshot(post_json(
            "/jobs",
            json!({"name": "A", "schedule": {"every": 60000}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = body_json(response).await["job"].clone();
    let job_id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["schedule"], json!({"every": 60000}));

    let patch = Request::builder()
        .method("PATCH")
        .uri(format!("/jobs/{job_id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"schedule": {"cron": "*/5 * * * *"}}).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(patch).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post_json("/jobs/history/undo", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["undone"], "update");

    let response = router.clone().oneshot(get("/jobs")).await.unwrap();
    let jobs = body_json(response).await["jobs"].clone();
    assert_eq!(jobs[0]["schedule"], json!({"every": 60000}));

    let response = router
        .clone()
        .oneshot(post_json("/jobs/history/redo", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["redone"], "update");
    let response = router.oneshot(get("/jobs")).await.unwrap();
    let jobs = body_json(response).await["jobs"].clone();
    assert_eq!(jobs[0]["schedule"], json!({"cron": "*/5 * * * *"}));
}

#[tokio::test]
async fn settings_patch_reports_restart_required() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);

    let patch = Request::builder()
        .method("PATCH")
        .uri("/settings/daemon")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"port": 9123}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(patch).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["settings"]["restartRequired"], true);
    assert_eq!(body["settings"]["desired"]["port"], 9123);
}

#[tokio::test]
async fn paused_operation_mode_blocks_new_runs() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);

    let patch = Request::builder()
        .method("PATCH")
        .uri("/control/operation")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"operationMode": "paused"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(patch).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post_json("/runs", json!({"instruction": "do x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = router
        .oneshot(post_json(
            "/jobs",
            json!({"name": "A", "schedule": {"every": 1000}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn chat_streams_frames_and_ends_with_done_marker() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);

    let response = router
        .oneshot(post_json(
            "/chat",
            json!({"message": "hello", "sessionId": "S1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.contains("text/event-stream"), "{content_type}");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert!(body.contains("session_info"), "{body}");
    assert!(body.trim_end().ends_with("data: [DONE]"), "{body}");
}

#[tokio::test]
async fn workflow_routes_validate_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let router = app_router(state(dir.path(), None).await);

    let response = router
        .clone()
        .oneshot(post_json(
            "/swarm/workflows",
            json!({"name": "wf", "workspaceDir": dir.path().join("ws").display().to_string()}),
        ))
        .await
        .unwrap();
    let workflow = body_json(response).await["workflow"].clone();
    let id = workflow["id"].as_str().unwrap().to_string();

    for node in ["a", "b"] {
        let response = router
            .clone()
            .oneshot(post_json(
                &format!("/swarm/workflows/{id}/nodes"),
                json!({"id": node, "name": node, "type": "agent_task"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/swarm/workflows/{id}/edges"),
            json!([
                {"from": "a", "to": "b"},
                {"from": "b", "to": "a"}
            ]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}
