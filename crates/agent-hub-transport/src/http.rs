//! Unary HTTP binding: create a session, send messages, close it.
//!
//! Sessions created here are keyed by a fresh thread id rather than the
//! user id, so one user may hold several threads.

use std::{collections::HashMap, sync::Arc};

use agent_hub_core::ErrorKind;
use agent_hub_session::{EndReason, SessionError, SessionManager};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_key: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub session_key: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session_key: String,
    pub closed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

/// Session failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Concurrency => StatusCode::CONFLICT,
            ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

/// POST /sessions
pub async fn create_session(
    State(manager): State<Arc<SessionManager>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = Uuid::new_v4().to_string();
    let lease = manager.initialize_for(&req.user_id, &thread_id).await?;

    let response = CreateSessionResponse {
        session_key: lease.key,
        message: "initialized".to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /sessions/{session_key}/messages
pub async fn send_message(
    State(manager): State<Arc<SessionManager>>,
    Path(session_key): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let lease = manager
        .lease_for(&session_key)
        .ok_or_else(|| SessionError::NotFound(session_key.clone()))?;
    let content = manager
        .send_message(&lease, &req.content, req.metadata)
        .await?;

    Ok(Json(SendMessageResponse {
        session_key,
        content,
    }))
}

/// DELETE /sessions/{session_key}
pub async fn close_session(
    State(manager): State<Arc<SessionManager>>,
    Path(session_key): Path<String>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    let closed = manager.close_key(&session_key, EndReason::Closed).await?;
    debug!(%session_key, closed, "Close requested");
    Ok(Json(CloseSessionResponse {
        session_key,
        closed,
    }))
}

/// GET /health
pub async fn health(State(manager): State<Arc<SessionManager>>) -> impl IntoResponse {
    let (status, label) = if manager.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            sessions: manager.session_count(),
        }),
    )
}

/// Create the unary session router.
#[must_use]
pub fn create_http_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{session_key}", axum::routing::delete(close_session))
        .route("/sessions/{session_key}/messages", post(send_message))
        .with_state(manager)
}
