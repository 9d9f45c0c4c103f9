use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

use ember_core::{EngineError, PermissionDecision};
use ember_observability::{emit_event, ObservabilityEvent, ProcessKind};
use ember_tools::{payload_result, CapabilityError};
use ember_types::{EngineEvent, ToolResult};

use crate::AppState;

const BACKUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Error body sent to clients: a stable kind plus a readable message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_arguments".to_string(),
            message: message.into(),
        }
    }
}

fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "invalid_arguments" => StatusCode::BAD_REQUEST,
        "permission_denied" => StatusCode::FORBIDDEN,
        "task_not_found" | "unknown_tool" => StatusCode::NOT_FOUND,
        "confirmation_required" | "invalid_state" | "duplicate_tool" => StatusCode::CONFLICT,
        "connectivity" | "backend_error" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let kind = err.kind().to_string();
        Self {
            status: status_for_kind(&kind),
            kind,
            message: err.to_string(),
        }
    }
}

impl From<CapabilityError> for ApiError {
    fn from(err: CapabilityError) -> Self {
        EngineError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed ({}): {}", self.kind, self.message);
        }
        (
            self.status,
            Json(json!({"errorType": self.kind, "message": self.message})),
        )
            .into_response()
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let health_monitor = state.router.spawn_health_monitor(
        Duration::from_secs(state.settings.backends.health_interval_secs.max(1)),
        shutdown.clone(),
    );
    let sweeper_state = state.clone();
    let sweeper_cancel = shutdown.clone();
    let backup_sweeper = tokio::spawn(async move {
        let days = sweeper_state.settings.daemon.backup_retention_days;
        loop {
            match sweeper_state.tasks().cleanup_old_backups(days).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("removed {} expired backup(s)", removed),
                Err(err) => tracing::warn!("backup retention sweep failed: {}", err),
            }
            tokio::select! {
                _ = sweeper_cancel.cancelled() => break,
                _ = tokio::time::sleep(BACKUP_SWEEP_INTERVAL) => {}
            }
        }
    });

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    emit_event(
        Level::INFO,
        ProcessKind::Daemon,
        ObservabilityEvent {
            event: "daemon.listening",
            component: "http",
            detail: Some(&addr.to_string()),
            ..Default::default()
        },
    );
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    shutdown.cancel();
    let _ = health_monitor.await;
    let _ = backup_sweeper.await;
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/config", get(config))
        .route("/api/command", post(process_command))
        .route("/api/tasks", get(list_tasks))
        .route("/api/task/{id}", get(get_task))
        .route("/api/task/{id}/confirm", post(confirm_task))
        .route("/api/task/{id}/cancel", post(cancel_task))
        .route("/api/task/{id}/rollback", post(rollback_task))
        .route("/api/snapshots", get(list_snapshots))
        .route("/api/snapshots/{id}/restore", post(restore_snapshot))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{name}", get(get_tool))
        .route("/api/tool", post(execute_tool))
        .route("/api/events", get(events))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": crate::now_ms().saturating_sub(state.started_at_ms),
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.orchestrator.get_status().await;
    let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
    if let Some(map) = body.as_object_mut() {
        map.insert("backends".to_string(), state.router.backend_stats().await);
    }
    Json(body)
}

async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "effective": state.config.get_effective_value().await,
        "layers": state.config.get_layers_value().await,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandInput {
    message: String,
    #[serde(default, alias = "attached_files")]
    attached_files: Vec<PathBuf>,
}

async fn process_command(
    State(state): State<AppState>,
    Json(input): Json<CommandInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if input.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let accepted = state
        .orchestrator
        .process_command(&input.message, input.attached_files)
        .await;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(accepted).unwrap_or_default()),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(20);
    Json(json!({
        "active": state.tasks().active_tasks().await,
        "history": state.tasks().task_history(limit).await,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state
        .orchestrator
        .task(&id)
        .await
        .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct ConfirmInput {
    #[serde(default = "default_confirmed")]
    confirmed: bool,
}

fn default_confirmed() -> bool {
    true
}

async fn confirm_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    input: Option<Json<ConfirmInput>>,
) -> Result<Json<Value>, ApiError> {
    let confirmed = input.map(|Json(i)| i.confirmed).unwrap_or(true);
    let stage = state.orchestrator.confirm_action(&id, confirmed).await?;
    Ok(Json(json!({"taskId": id, "status": stage})))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stage = state.orchestrator.cancel_task(&id).await?;
    Ok(Json(json!({"taskId": id, "status": stage})))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RollbackInput {
    #[serde(default, alias = "snapshot_id")]
    snapshot_id: Option<String>,
}

async fn rollback_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    input: Option<Json<RollbackInput>>,
) -> Result<Json<Value>, ApiError> {
    let snapshot_id = input.and_then(|Json(i)| i.snapshot_id);
    let snapshot = state
        .orchestrator
        .rollback_task(&id, snapshot_id.as_deref())
        .await?;
    Ok(Json(json!({
        "taskId": id,
        "status": "rolled_back",
        "snapshot": snapshot,
    })))
}

/// Snapshots read back from disk, including those of tasks no longer in memory.
async fn list_snapshots(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshots = state.tasks().list_persisted_snapshots().await?;
    Ok(Json(json!({ "snapshots": snapshots })))
}

async fn restore_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state.tasks().restore_persisted_snapshot(&id).await?;
    Ok(Json(json!({ "status": "restored", "snapshot": snapshot })))
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.registry().list().await).unwrap_or_default())
}

async fn get_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manifest = state
        .registry()
        .manifest(&name)
        .await
        .ok_or_else(|| CapabilityError::UnknownTool(name.clone()))?;
    let stats = state.registry().stats(&name).await.unwrap_or_default();
    Ok(Json(json!({"manifest": manifest, "stats": stats})))
}

#[derive(Debug, Deserialize)]
struct ToolExecutionInput {
    tool: String,
    args: Option<Value>,
    #[serde(default)]
    confirmed: bool,
}

/// Direct tool call outside any plan. Permissions and the confirmation
/// policy still apply; no snapshot is taken.
async fn execute_tool(
    State(state): State<AppState>,
    Json(input): Json<ToolExecutionInput>,
) -> Result<Json<ToolResult>, ApiError> {
    let args = input.args.unwrap_or_else(|| json!({}));
    let manifest = state
        .registry()
        .manifest(&input.tool)
        .await
        .ok_or_else(|| CapabilityError::UnknownTool(input.tool.clone()))?;
    let permissions = state.orchestrator.permissions();
    if let PermissionDecision::Deny { reason } = permissions.check(&manifest, &args) {
        return Err(EngineError::PermissionDenied(reason).into());
    }
    if !input.confirmed && permissions.requires_confirmation(&manifest, &args) {
        return Err(
            EngineError::ConfirmationRequired(permissions.confirmation_message(&manifest, &args))
                .into(),
        );
    }
    let started = Instant::now();
    let result = state.registry().execute(&input.tool, args).await?;
    Ok(Json(payload_result(
        &input.tool,
        result,
        started.elapsed().as_millis() as u64,
    )))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EventFilterQuery {
    #[serde(default, alias = "task_id")]
    task_id: Option<String>,
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let Some(wanted) = filter.task_id.as_deref() else {
        return true;
    };
    event
        .properties
        .get("taskId")
        .and_then(|v| v.as_str())
        .is_some_and(|id| id == wanted)
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok::<_, std::convert::Infallible>(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if event_matches_filter(&event, &filter) => {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().event(event.event_type.clone()).data(payload)))
        }
        _ => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ember_core::{
        ConfigStore, ConversationMemory, ConversationRecord, EmberConfig, EventBus,
        OrchestratorSettings, PermissionEvaluator, PermissionsConfig, Planner, RequestContext,
        TaskManager, WorkflowOrchestrator,
    };
    use ember_providers::{Backend, BackendHealth, ModelRouter, RawCompletion, RouterError, TokenStream};
    use ember_tools::CapabilityRegistry;
    use ember_types::{CompletionRequest, ExecutionPlan, ModelType, PlanStep};
    use tower::ServiceExt;

    struct DownBackend(ModelType);

    #[async_trait]
    impl Backend for DownBackend {
        fn model_type(&self) -> ModelType {
            self.0
        }

        fn base_url(&self) -> &str {
            "http://down"
        }

        async fn probe(&self) -> Result<BackendHealth, RouterError> {
            Err(RouterError::Unreachable {
                backend: self.0,
                message: "offline".to_string(),
            })
        }

        async fn complete(&self, _req: &CompletionRequest) -> Result<RawCompletion, RouterError> {
            Err(RouterError::Connectivity("offline".to_string()))
        }

        async fn stream(&self, _req: &CompletionRequest) -> Result<TokenStream, RouterError> {
            Err(RouterError::Connectivity("offline".to_string()))
        }
    }

    struct FixedPlanner(ExecutionPlan);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn create_plan(
            &self,
            _message: &str,
            _context: &RequestContext,
        ) -> anyhow::Result<ExecutionPlan> {
            Ok(self.0.clone())
        }

        async fn synthesize_response(
            &self,
            _message: &str,
            _plan: &ExecutionPlan,
            _results: &[ToolResult],
        ) -> anyhow::Result<String> {
            Ok("done".to_string())
        }
    }

    #[derive(Default)]
    struct NullMemory(Mutex<Vec<ConversationRecord>>);

    #[async_trait]
    impl ConversationMemory for NullMemory {
        async fn store_conversation(&self, record: ConversationRecord) -> anyhow::Result<String> {
            self.0.lock().expect("memory").push(record);
            Ok("c".to_string())
        }

        async fn recent_conversations(
            &self,
            _limit: usize,
        ) -> anyhow::Result<Vec<ConversationRecord>> {
            Ok(Vec::new())
        }
    }

    async fn test_state(
        plan_for: impl FnOnce(&std::path::Path) -> ExecutionPlan,
    ) -> (AppState, tempfile::TempDir) {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_for(temp.path());
        std::env::set_var("EMBER_GLOBAL_CONFIG", temp.path().join("global.json"));
        let config = ConfigStore::new(None, None).await.expect("config");
        let router = ModelRouter::new(
            Arc::new(DownBackend(ModelType::Text)),
            Arc::new(DownBackend(ModelType::Vision)),
        );
        let registry = CapabilityRegistry::with_builtins().await.expect("registry");
        let allowed = format!("{}/*", temp.path().display());
        let permissions = PermissionEvaluator::new(PermissionsConfig {
            filesystem_read_allowed: vec![allowed.clone()],
            filesystem_write_allowed: vec![allowed],
            ..PermissionsConfig::default()
        });
        let event_bus = EventBus::new();
        let orchestrator = WorkflowOrchestrator::new(
            Arc::new(FixedPlanner(plan)),
            Arc::new(NullMemory::default()),
            registry,
            permissions,
            TaskManager::new(temp.path().join("backups"), 10),
            event_bus.clone(),
            OrchestratorSettings::default(),
        )
        .with_router(router.clone());
        let state = AppState {
            config,
            settings: Arc::new(EmberConfig::default()),
            orchestrator,
            router,
            event_bus,
            started_at_ms: crate::now_ms(),
        };
        (state, temp)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, payload)
    }

    #[tokio::test]
    async fn status_reports_disconnected_backends_and_tools() {
        let (state, _temp) = test_state(|_| ExecutionPlan::default()).await;
        let (code, body) = send(app_router(state), "GET", "/api/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["running"], true);
        assert_eq!(body["llmConnected"], false);
        assert_eq!(body["toolsLoaded"], 5);
        assert_eq!(body["activeTasks"], 0);
    }

    #[tokio::test]
    async fn command_awaits_confirmation_then_rejects_cleanly() {
        let (state, temp) = test_state(|dir| {
            let victim = dir.join("keep.txt");
            std::fs::write(&victim, "keep").expect("seed");
            ExecutionPlan::new(vec![PlanStep::new(
                "filesystem.delete",
                json!({"path": victim.to_string_lossy()}),
            )])
        })
        .await;
        let victim = temp.path().join("keep.txt");
        let mut events = state.event_bus.subscribe();
        let (code, body) = send(
            app_router(state.clone()),
            "POST",
            "/api/command",
            Some(json!({"message": "delete keep.txt"})),
        )
        .await;
        assert_eq!(code, StatusCode::ACCEPTED);
        let task_id = body["taskId"].as_str().expect("task id").to_string();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event");
                if event.event_type == "task.confirmation_required" {
                    assert_eq!(event.properties["taskId"], task_id.as_str());
                    break;
                }
            }
        })
        .await
        .expect("confirmation event");

        let (code, body) = send(
            app_router(state.clone()),
            "POST",
            &format!("/api/task/{task_id}/confirm"),
            Some(json!({"confirmed": false})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert!(victim.exists());

        let (code, body) = send(
            app_router(state),
            "GET",
            &format!("/api/task/{task_id}"),
            None,
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["stage"], "cancelled");
        assert_eq!(body["task"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn unknown_task_maps_to_not_found_with_error_kind() {
        let (state, _temp) = test_state(|_| ExecutionPlan::default()).await;
        let (code, body) = send(app_router(state), "POST", "/api/task/nope/cancel", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["errorType"], "task_not_found");
        assert!(body["message"].as_str().is_some());
    }

    #[tokio::test]
    async fn direct_tool_call_enforces_permissions_and_validation() {
        let (state, temp) = test_state(|_| ExecutionPlan::default()).await;
        let app = app_router(state);

        let (code, body) = send(
            app.clone(),
            "POST",
            "/api/tool",
            Some(json!({"tool": "filesystem.write", "args": {"path": "/etc/ember-x", "content": "x"}})),
        )
        .await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        assert_eq!(body["errorType"], "permission_denied");

        let (code, body) = send(
            app.clone(),
            "POST",
            "/api/tool",
            Some(json!({"tool": "filesystem.write", "args": {"path": temp.path().join("a.txt").to_string_lossy()}})),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "invalid_arguments");

        let target = temp.path().join("b.txt");
        let (code, body) = send(
            app,
            "POST",
            "/api/tool",
            Some(json!({"tool": "filesystem.write", "args": {"path": target.to_string_lossy(), "content": "hi"}})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(std::fs::read_to_string(target).expect("written"), "hi");
    }

    /// Reports failure in its payload instead of returning an error.
    struct RefusingTool;

    #[async_trait]
    impl ember_tools::Capability for RefusingTool {
        fn manifest(&self) -> ember_types::ToolManifest {
            ember_types::ToolManifest::new(
                "test.refuse",
                "Always refuses",
                ember_types::ToolCategory::System,
            )
        }

        async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
            Ok(json!({"success": false, "error": "window not found"}))
        }
    }

    #[tokio::test]
    async fn direct_tool_call_reports_in_band_failure() {
        let (state, _temp) = test_state(|_| ExecutionPlan::default()).await;
        state
            .registry()
            .register(Arc::new(RefusingTool))
            .await
            .expect("register");
        let (code, body) = send(
            app_router(state),
            "POST",
            "/api/tool",
            Some(json!({"tool": "test.refuse", "args": {}})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["errorType"], "tool_execution");
        assert_eq!(body["error"], "window not found");
        assert_eq!(body["result"]["success"], false);
    }

    #[tokio::test]
    async fn destructive_direct_call_needs_confirmed_flag() {
        let (state, temp) = test_state(|_| ExecutionPlan::default()).await;
        let victim = temp.path().join("v.txt");
        std::fs::write(&victim, "v").expect("seed");
        let (code, body) = send(
            app_router(state),
            "POST",
            "/api/tool",
            Some(json!({"tool": "filesystem.delete", "args": {"path": victim.to_string_lossy()}})),
        )
        .await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["errorType"], "confirmation_required");
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn tools_listing_and_lookup() {
        let (state, _temp) = test_state(|_| ExecutionPlan::default()).await;
        let (code, body) = send(app_router(state.clone()), "GET", "/api/tools", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.as_array().map(|a| a.len()), Some(5));

        let (code, body) =
            send(app_router(state.clone()), "GET", "/api/tools/filesystem.read", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["manifest"]["name"], "filesystem.read");

        let (code, _) = send(app_router(state), "GET", "/api/tools/nope", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (state, _temp) = test_state(|_| ExecutionPlan::default()).await;
        let (code, body) = send(
            app_router(state),
            "POST",
            "/api/command",
            Some(json!({"message": "   "})),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "invalid_arguments");
    }

    #[tokio::test]
    async fn persisted_snapshot_restores_without_task_in_memory() {
        let (state, temp) = test_state(|_| ExecutionPlan::default()).await;
        let target = temp.path().join("notes.txt");
        std::fs::write(&target, "v1").expect("seed");
        // An earlier daemon run over the same backup directory.
        let previous = TaskManager::new(temp.path().join("backups"), 10);
        previous
            .create_task("gone-task", "edit notes", ExecutionPlan::default())
            .await
            .expect("task");
        let snapshot = previous
            .create_snapshot("gone-task", "filesystem.write", &[target.clone()], json!({}))
            .await
            .expect("snapshot");
        assert!(state.tasks().task("gone-task").await.is_none());
        std::fs::write(&target, "v2").expect("overwrite");

        let (code, body) = send(app_router(state.clone()), "GET", "/api/snapshots", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["snapshots"][0]["id"], snapshot.id.as_str());

        let (code, body) = send(
            app_router(state),
            "POST",
            &format!("/api/snapshots/{}/restore", snapshot.id),
            None,
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "restored");
        assert_eq!(std::fs::read_to_string(&target).expect("restored"), "v1");
    }

    #[test]
    fn event_filter_matches_task_id() {
        let event = EngineEvent::new("task.progress", json!({"taskId": "t1"}));
        assert!(event_matches_filter(&event, &EventFilterQuery::default()));
        assert!(event_matches_filter(
            &event,
            &EventFilterQuery {
                task_id: Some("t1".to_string())
            }
        ));
        assert!(!event_matches_filter(
            &event,
            &EventFilterQuery {
                task_id: Some("t2".to_string())
            }
        ));
    }
}
