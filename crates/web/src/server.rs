//! Web server implementation

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use playdeck_common::{Error, ErrorKind, RunEvent, RunId, RunRequest};
use playdeck_orchestrator::RunController;
use std::net::SocketAddr;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Orchestrator error carried to an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match (&self.0, kind) {
            (Error::RunNotFound { .. }, _) => StatusCode::NOT_FOUND,
            (_, ErrorKind::UserInput) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Conflict) => StatusCode::CONFLICT,
            (_, ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        let kind = match kind {
            ErrorKind::UserInput => "user_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string(), "kind": kind })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// All routes, sharing one controller
pub fn router(controller: RunController) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/scripts", get(scripts_handler))
        .route("/api/runs", get(history_handler).post(start_handler))
        .route("/api/runs/stop", post(stop_handler))
        .route("/api/runs/latest", get(latest_handler))
        .route("/api/runs/:run_id", get(run_handler))
        .route("/api/runs/:run_id/rerun", post(rerun_handler))
        .route("/api/events", get(events_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Serve until ctrl-c; an active run is stopped on the way out.
pub async fn serve(addr: SocketAddr, controller: RunController) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Playdeck listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(controller.clone()))
        .with_graceful_shutdown(shutdown_signal(controller))
        .await?;

    info!("Playdeck shutdown complete");
    Ok(())
}

async fn shutdown_signal(controller: RunController) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
    match controller.stop().await {
        Ok(run_id) => info!("Stopped run {} on shutdown", run_id),
        Err(Error::NotRunning) => {}
        Err(e) => warn!("Failed to stop active run on shutdown: {}", e),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "playdeck",
        "version": playdeck_common::VERSION,
    }))
}

async fn status_handler(State(controller): State<RunController>) -> impl IntoResponse {
    Json(controller.status())
}

async fn scripts_handler(State(controller): State<RunController>) -> impl IntoResponse {
    Json(controller.scripts())
}

async fn start_handler(
    State(controller): State<RunController>,
    Json(request): Json<RunRequest>,
) -> ApiResult<impl IntoResponse> {
    let config = request.into_config()?;
    let run_id = controller.start(config)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": run_id }))))
}

async fn stop_handler(State(controller): State<RunController>) -> ApiResult<impl IntoResponse> {
    let run_id = controller.stop().await?;
    Ok(Json(serde_json::json!({ "run_id": run_id })))
}

async fn rerun_handler(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id: RunId = run_id.parse()?;
    let new_run_id = controller.rerun(run_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": new_run_id })),
    ))
}

async fn history_handler(State(controller): State<RunController>) -> impl IntoResponse {
    Json(controller.history())
}

async fn latest_handler(State(controller): State<RunController>) -> ApiResult<impl IntoResponse> {
    controller
        .latest()
        .map(Json)
        .ok_or_else(|| ApiError(Error::run_not_found("latest")))
}

async fn run_handler(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id: RunId = run_id.parse()?;
    controller
        .get(run_id)
        .map(Json)
        .ok_or_else(|| ApiError(Error::run_not_found(run_id)))
}

async fn events_handler(
    State(controller): State<RunController>,
    ws: WebSocketUpgrade,
) -> Response {
    // Subscribe before the upgrade so nothing emitted in between is missed.
    let rx = controller.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(socket: WebSocket, mut rx: broadcast::Receiver<RunEvent>) {
    let (mut ws_write, mut ws_read) = socket.split();
    debug!("Event observer connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event observer lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Event socket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = ws_write.close().await;
    debug!("Event observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use playdeck_orchestrator::OrchestratorConfig;
    use std::path::Path as FsPath;
    use tower::ServiceExt;

    fn test_controller(dir: &FsPath, script: &str) -> RunController {
        let mut config = OrchestratorConfig::default();
        config.data_dir = dir.join("data");
        config.termination_grace_ms = 200;
        config.suite.command = "sh".to_string();
        config.suite.args = vec!["-c".to_string(), script.to_string(), "suite".to_string()];
        config.suite.reporter_arg = None;
        config.suite.working_dir = dir.to_path_buf();
        RunController::new(config).unwrap()
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_controller(dir.path(), "true"));
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_start_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_controller(dir.path(), "true"));

        let (status, body) = call(
            &app,
            "POST",
            "/api/runs",
            Some(serde_json::json!({ "region": "ZA", "scripts": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "user_input");

        let (status, _) = call(
            &app,
            "POST",
            "/api/runs",
            Some(serde_json::json!({ "region": "XX", "scripts": ["login"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_idle_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_controller(dir.path(), "true"));

        let (status, body) = call(&app, "POST", "/api/runs/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let (status, _) = call(&app, "GET", "/api/runs/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/runs/12345", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/runs/not-a-run", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/runs/12345/rerun", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/api/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn test_start_conflict_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_controller(dir.path(), "sleep 30"));
        let request = serde_json::json!({ "region": "za", "scripts": ["login"] });

        let (status, body) = call(&app, "POST", "/api/runs", Some(request.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["run_id"].as_u64().unwrap();

        let (status, _) = call(&app, "POST", "/api/runs", Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["state"], "running");
        assert_eq!(body["run_id"].as_u64(), Some(run_id));

        let (status, body) = call(&app, "POST", "/api/runs/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_id"].as_u64(), Some(run_id));

        let (status, body) = call(&app, "GET", &format!("/api/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["config"]["region"], "ZA");
    }

    #[tokio::test]
    async fn test_scripts_are_discovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests/nested")).unwrap();
        std::fs::write(dir.path().join("tests/login.spec.ts"), "").unwrap();
        std::fs::write(dir.path().join("tests/nested/betslip.spec.ts"), "").unwrap();
        std::fs::write(dir.path().join("tests/helpers.ts"), "").unwrap();

        let app = router(test_controller(dir.path(), "true"));
        let (status, body) = call(&app, "GET", "/api/scripts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(["betslip", "login"]));
    }
}
