pub mod events;
pub mod handlers;
pub mod stats;

use axum::routing::get;
use axum::Router;

use crate::state::SharedState;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        // Events
        .route("/api/v1/events", get(events::list).post(events::create))
        .route("/api/v1/events/{id}", get(events::get))
        // Queue overview
        .route("/api/v1/stats", get(stats::stats))
        .route("/api/v1/handlers", get(handlers::list_handlers))
}
