use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EventStatus, QueueItem};
use crate::queue::NewEvent;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<NewEvent>,
) -> Result<Json<QueueItem>, AppError> {
    let item = state.queue.enqueue(req).await?;
    Ok(Json(item))
}

pub async fn list(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            EventStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown status: {s}")))?,
        ),
    };

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let events = state.queue.list(status, per_page, offset).await?;

    Ok(Json(json!({
        "events": events,
        "page": page,
        "per_page": per_page,
    })))
}

pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueItem>, AppError> {
    let item = state.queue.get(id).await?;
    Ok(Json(item))
}
