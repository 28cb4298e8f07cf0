//! REST + WebSocket surface for Task Records.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{TaskInput, TaskKind, TaskStatusView};
use super::notifier::TaskStatusChange;
use super::service::TaskService;
use crate::engine::WorkflowEngine;
use crate::error::{EngineError, TaskError};

/// Tasks sent in the initial WebSocket sync.
const SYNC_LIMIT: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: TaskService,
    pub engine: Arc<WorkflowEngine>,
}

/// Frames pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// The owner's recent tasks (sent on connect and after a lag).
    TasksSync { tasks: Vec<TaskStatusView> },
    /// One status change.
    TaskUpdate(TaskStatusChange),
}

/// Build the Axum router with task REST and WebSocket routes.
pub fn task_routes(service: TaskService, engine: Arc<WorkflowEngine>) -> Router {
    let state = AppState { service, engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/workflows/{name}/trigger", post(trigger_workflow))
        .route("/ws/tasks/{owner_id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fit-pipeline",
        "running_runs": state.engine.running_count(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn task_error_response(e: TaskError) -> Response {
    let status = match &e {
        TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
        TaskError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TaskError::Conflict { .. } | TaskError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TaskError::Database(_) | TaskError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

#[derive(Deserialize)]
struct SubmitRequest {
    owner_id: String,
    kind: TaskKind,
    #[serde(default)]
    input: serde_json::Value,
}

impl SubmitRequest {
    fn task_input(&self) -> Result<TaskInput, serde_json::Error> {
        let input = if self.input.is_null() {
            serde_json::json!({})
        } else {
            self.input.clone()
        };
        serde_json::from_value(serde_json::json!({ "kind": self.kind, "input": input }))
    }
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let input = match body.task_input() {
        Ok(input) => input,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid input: {e}")),
    };
    match state.service.submit_task(&body.owner_id, input).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": task_id })),
        )
            .into_response(),
        Err(e) => task_error_response(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_task_status(id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => task_error_response(e),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    owner_id: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    match state
        .service
        .list_tasks(&query.owner_id, query.limit.min(500))
        .await
    {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => task_error_response(e),
    }
}

async fn retry_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.retry_task(id).await {
        Ok(view) => {
            info!(task_id = %id, "Task retried via API");
            (StatusCode::ACCEPTED, Json(view)).into_response()
        }
        Err(e) => task_error_response(e),
    }
}

// ── Workflows ───────────────────────────────────────────────────────────

async fn trigger_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    // An empty body fires the workflow with an empty payload.
    let payload = if body.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid payload: {e}"));
            }
        }
    };
    match state.engine.fire_manual(&name, payload).await {
        Ok(event_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "event_id": event_id })),
        )
            .into_response(),
        Err(e @ EngineError::UnknownWorkflow(_)) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> impl IntoResponse {
    info!(owner_id = %owner_id, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state.service, owner_id))
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode WS frame: {e}");
            true
        }
    }
}

async fn sync_frame(service: &TaskService, owner_id: &str) -> WsFrame {
    let tasks = match service.list_tasks(owner_id, SYNC_LIMIT).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(owner_id = %owner_id, "Failed to load tasks for sync: {e}");
            Vec::new()
        }
    };
    WsFrame::TasksSync { tasks }
}

async fn handle_socket(mut socket: WebSocket, service: TaskService, owner_id: String) {
    // Subscribe before the sync so no change falls in between.
    let mut rx = service.tasks().notifier().subscribe();

    if !send_frame(&mut socket, &sync_frame(&service, &owner_id).await).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(change) if change.owner_id == owner_id => {
                        if !send_frame(&mut socket, &WsFrame::TaskUpdate(change)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_frame(&mut socket, &sync_frame(&service, &owner_id).await).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(owner_id = %owner_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(owner_id = %owner_id, "WebSocket connection closed");
}
