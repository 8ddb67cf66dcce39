use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors returned by the queue operations.
///
/// Handler failures are not errors at this level: they are recorded as state
/// transitions. Everything here means the requested change was not made.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("queue item {0} not found")]
    NotFound(Uuid),
    #[error("queue item {id} is not claimed")]
    NotClaimed { id: Uuid },
    #[error("claim on queue item {id} is stale")]
    StaleClaim { id: Uuid },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Store(StoreError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            AppError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            AppError::Store(err) => write!(f, "Store Error: {err}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Store(err) => {
                tracing::error!("Store error: {err}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Queue store unavailable".to_string(),
                )
            }
        };

        let body = json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(msg) => AppError::BadRequest(msg),
            QueueError::NotFound(id) => AppError::NotFound(format!("Event {id} not found")),
            QueueError::NotClaimed { .. } | QueueError::StaleClaim { .. } => {
                AppError::Conflict(err.to_string())
            }
            QueueError::Store(err) => AppError::Store(err),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}
