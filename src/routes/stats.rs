use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::models::StatusCounts;
use crate::state::SharedState;

pub async fn stats(State(state): State<SharedState>) -> Result<Json<StatusCounts>, AppError> {
    let counts = state.queue.stats().await?;
    Ok(Json(counts))
}
