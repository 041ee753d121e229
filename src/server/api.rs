use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tracing::{error, warn};

use super::SharedState;
use crate::errors::RuntimeError;
use crate::runtime::ExecRequest;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessBody {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(RuntimeError);

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &RuntimeError) -> StatusCode {
    match err {
        RuntimeError::RuntimeNotFound { .. }
        | RuntimeError::ProjectNotFound { .. }
        | RuntimeError::ProcessNotFound { .. } => StatusCode::NOT_FOUND,
        RuntimeError::AlreadyExists { .. }
        | RuntimeError::AlreadyRunning { .. }
        | RuntimeError::NotRunning { .. } => StatusCode::CONFLICT,
        RuntimeError::PolicyRejected(_) => StatusCode::FORBIDDEN,
        RuntimeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RuntimeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RuntimeError::External { .. } => StatusCode::BAD_GATEWAY,
        RuntimeError::Database(_) | RuntimeError::StoreUnavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/runtimes", get(list_runtimes))
        .route("/projects/{project}/runtime", delete(delete_runtime))
        .route("/projects/{project}/runtime/start", post(start_runtime))
        .route("/projects/{project}/runtime/status", get(runtime_status))
        .route("/projects/{project}/runtime/stop", post(stop_runtime))
        .route("/projects/{project}/runtime/exec", post(exec_command))
        .route(
            "/projects/{project}/runtime/process",
            post(start_process).get(process_status).delete(stop_process),
        )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_runtimes(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.list().await?))
}

async fn start_runtime(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.ensure_started(&project).await?))
}

async fn runtime_status(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.status(&project).await?))
}

/// Stopping the container also ends whatever ran inside it.
async fn stop_runtime(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.lifecycle.stop(&project).await?;
    state.terminals.close(&project).await;
    state.processes.stop(&project).await;
    Ok(Json(record))
}

async fn delete_runtime(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.terminals.close(&project).await;
    state.processes.stop(&project).await;
    state.lifecycle.remove(&project).await?;
    Ok(Json(serde_json::json!({"status": "deleted"})))
}

async fn exec_command(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = ExecRequest {
        command: body.command,
        args: body.args,
        cwd: body.cwd,
        timeout: body.timeout_secs.map(Duration::from_secs),
        env: body.env,
    };
    let output = state.executor.exec(&project, request).await.inspect_err(|e| {
        if matches!(e, RuntimeError::PolicyRejected(_)) {
            warn!(project = %project, error = %e, "Rejected command");
        }
    })?;
    Ok(Json(output))
}

async fn start_process(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    Json(body): Json<ProcessBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.lifecycle.status(&project).await?;
    if !record.is_running() {
        return Err(RuntimeError::NotRunning { project }.into());
    }
    state
        .policy
        .validate(&body.command, &body.args, body.cwd.as_deref())
        .map_err(RuntimeError::from)?;

    let process = state
        .processes
        .start(
            &project,
            &record.container_name,
            &body.command,
            &body.args,
            body.cwd.as_deref(),
            body.env,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(process.info())))
}

async fn process_status(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.processes.get_process(&project).await {
        Some(process) => Ok(Json(process.info())),
        None => Err(RuntimeError::ProcessNotFound { project }.into()),
    }
}

async fn stop_process(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.processes.stop(&project).await {
        return Err(RuntimeError::ProcessNotFound { project }.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandRule, RunwayConfig};
    use crate::errors::PolicyViolation;
    use crate::runtime::RuntimeStore;
    use crate::runtime::testing::FakeRuntime;
    use crate::server::{AppState, build_router};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        state: SharedState,
    }

    impl TestApp {
        fn new(projects: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for p in projects {
                std::fs::create_dir(dir.path().join(p)).unwrap();
            }
            let mut config = RunwayConfig::default();
            config.projects.root = dir.path().to_path_buf();
            for name in ["echo", "sleep"] {
                config.policy.commands.insert(
                    name.to_string(),
                    CommandRule {
                        any_args: true,
                        ..CommandRule::default()
                    },
                );
            }
            let state = AppState::new(
                &config,
                RuntimeStore::in_memory().unwrap(),
                Arc::new(FakeRuntime::new()),
            )
            .unwrap();
            Self {
                _dir: dir,
                state: Arc::new(state),
            }
        }

        async fn send(&self, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(json) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let resp = build_router(self.state.clone())
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RuntimeError::RuntimeNotFound { project: "p".into() }, StatusCode::NOT_FOUND),
            (RuntimeError::AlreadyExists { project: "p".into() }, StatusCode::CONFLICT),
            (RuntimeError::NotRunning { project: "p".into() }, StatusCode::CONFLICT),
            (
                RuntimeError::PolicyRejected(PolicyViolation::EmptyCommand),
                StatusCode::FORBIDDEN,
            ),
            (RuntimeError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                RuntimeError::Timeout { timeout: Duration::from_secs(1) },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (RuntimeError::external("start", "c", "boom"), StatusCode::BAD_GATEWAY),
            (
                RuntimeError::StoreUnavailable("gone".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new(&[]);
        let (status, body) = app.send("GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_unknown_project_is_404() {
        let app = TestApp::new(&[]);
        let (status, body) = app.send("GET", "/projects/ghost/runtime/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_start_creates_and_starts() {
        let app = TestApp::new(&["demo"]);
        let (status, body) = app.send("POST", "/projects/demo/runtime/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["container_name"], "ai_builder_demo");

        let (status, body) = app.send("GET", "/runtimes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_missing_project_dir_is_404() {
        let app = TestApp::new(&[]);
        let (status, _) = app.send("POST", "/projects/ghost/runtime/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_invalid_name_is_400() {
        let app = TestApp::new(&[]);
        let (status, _) = app.send("POST", "/projects/-bad/runtime/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exec_flow() {
        let app = TestApp::new(&["demo"]);
        let payload = serde_json::json!({"command": "echo", "args": ["hi"]});

        let (status, _) = app
            .send("POST", "/projects/demo/runtime/exec", Some(payload.clone()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.send("POST", "/projects/demo/runtime/start", None).await;
        let (status, body) = app
            .send("POST", "/projects/demo/runtime/exec", Some(payload.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exit_code"], 0);
        assert_eq!(body["stdout"], "hi");

        let (status, body) = app
            .send(
                "POST",
                "/projects/demo/runtime/exec",
                Some(serde_json::json!({"command": "echo", "args": ["a;b"]})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains(";"));

        app.send("POST", "/projects/demo/runtime/stop", None).await;
        let (status, _) = app
            .send("POST", "/projects/demo/runtime/exec", Some(payload))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let app = TestApp::new(&["demo"]);
        app.send("POST", "/projects/demo/runtime/start", None).await;
        let payload = serde_json::json!({"command": "sleep", "args": ["5"]});

        let (status, body) = app
            .send("POST", "/projects/demo/runtime/process", Some(payload.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["command"], "sleep 5");
        assert_eq!(body["alive"], true);

        let (status, _) = app
            .send("POST", "/projects/demo/runtime/process", Some(payload))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app.send("GET", "/projects/demo/runtime/process", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["project"], "demo");

        let (status, _) = app.send("DELETE", "/projects/demo/runtime/process", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.send("DELETE", "/projects/demo/runtime/process", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_process_rejected_by_policy() {
        let app = TestApp::new(&["demo"]);
        app.send("POST", "/projects/demo/runtime/start", None).await;
        let (status, _) = app
            .send(
                "POST",
                "/projects/demo/runtime/process",
                Some(serde_json::json!({"command": "bash", "args": ["-i"]})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!app.state.processes.has_process("demo").await);
    }

    #[tokio::test]
    async fn test_stop_runtime_ends_process() {
        let app = TestApp::new(&["demo"]);
        app.send("POST", "/projects/demo/runtime/start", None).await;
        app.send(
            "POST",
            "/projects/demo/runtime/process",
            Some(serde_json::json!({"command": "sleep", "args": ["5"]})),
        )
        .await;

        let (status, body) = app.send("POST", "/projects/demo/runtime/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert!(!app.state.processes.has_process("demo").await);
    }

    #[tokio::test]
    async fn test_delete_runtime() {
        let app = TestApp::new(&["demo"]);
        app.send("POST", "/projects/demo/runtime/start", None).await;
        let (status, body) = app.send("DELETE", "/projects/demo/runtime", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "deleted");
        let (status, _) = app.send("DELETE", "/projects/demo/runtime", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
