//! Client session handlers.
//!
//! Every response uses the `{success, data, error, kind}` envelope; `kind`
//! carries the server error kind so clients can tell a constraint
//! violation from an exhausted pool.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rowgate_core::{BackendError, ConnectionRequest, Operation};
use rowgate_server::{ServerError, SessionState};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, kind: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            kind: Some(kind.to_string()),
        }),
    )
        .into_response()
}

fn status_for(err: &ServerError) -> StatusCode {
    match err {
        ServerError::ClientNotFound(_) | ServerError::PoolNotFound(_) => StatusCode::NOT_FOUND,
        ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
        ServerError::NotConnected(_) => StatusCode::GONE,
        ServerError::PoolExhausted(_)
        | ServerError::ConnectionUnavailable(_)
        | ServerError::ConnectionLimitReached(_)
        | ServerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ServerError::InvalidConfiguration(_) | ServerError::Unsupported(_) => {
            StatusCode::BAD_REQUEST
        }
        ServerError::TransactionClosed(_) => StatusCode::CONFLICT,
        ServerError::Backend(backend) => match backend {
            BackendError::NotFound(_) => StatusCode::NOT_FOUND,
            BackendError::Constraint(_)
            | BackendError::StaleRecord(_)
            | BackendError::Transaction(_) => StatusCode::CONFLICT,
            BackendError::Unsupported(_) => StatusCode::BAD_REQUEST,
            BackendError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ServerError::UnexpectedOutcome { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn server_error(err: &ServerError) -> Response {
    error_response(&err.to_string(), err.kind(), status_for(err))
}

#[derive(Serialize)]
pub struct SessionView {
    pub client_id: Uuid,
    pub username: String,
    pub client_type: String,
    pub state: SessionState,
    pub connected: bool,
}

// ── Sessions ───────────────────────────────────────────────────

/// POST /api/v1/sessions
pub async fn connect(
    State(state): State<ApiState>,
    Json(request): Json<ConnectionRequest>,
) -> Response {
    match state.server.connect(request).await {
        Ok(session) => {
            let identity = session.identity();
            let view = SessionView {
                client_id: identity.client_id,
                username: identity.user.username.clone(),
                client_type: identity.client_type.clone(),
                state: session.state(),
                connected: session.is_connected(),
            };
            (StatusCode::CREATED, ApiResponse::ok(view)).into_response()
        }
        Err(e) => server_error(&e),
    }
}

/// GET /api/v1/sessions/{id}
pub async fn session_state(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.server.session(id) {
        Ok(session) => ApiResponse::ok(serde_json::json!({
            "client_id": id,
            "connected": session.is_connected(),
            "state": session.state(),
        }))
        .into_response(),
        Err(_) => ApiResponse::ok(serde_json::json!({
            "client_id": id,
            "connected": false,
            "state": SessionState::Disconnected,
        }))
        .into_response(),
    }
}

/// DELETE /api/v1/sessions/{id}
pub async fn disconnect(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    if state.server.disconnect(id).await {
        ApiResponse::ok("disconnected").into_response()
    } else {
        server_error(&ServerError::ClientNotFound(id))
    }
}

/// POST /api/v1/sessions/{id}/call
pub async fn call(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(operation): Json<Operation>,
) -> Response {
    let session = match state.server.session(id) {
        Ok(session) => session,
        Err(e) => return server_error(&e),
    };
    debug!(client_id = %id, method = operation.name(), "remote call");
    match session.invoke(operation).await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => server_error(&e),
    }
}
