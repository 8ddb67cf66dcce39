use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::SharedState;

pub async fn list_handlers(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "event_types": state.handlers.event_types() }))
}
