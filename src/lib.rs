pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod routes;
pub mod state;
pub mod store;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers::HandlerRegistry;
use crate::queue::Queue;
use crate::state::{AppState, SharedState};
use crate::store::QueueStore;

pub fn build_app(
    store: Arc<dyn QueueStore>,
    config: Config,
    handlers: HandlerRegistry,
) -> (Router, SharedState) {
    let queue = Queue::new(store, config.queue.clone());

    tracing::info!(
        "Registered handlers: {}",
        handlers.event_types().join(", ")
    );

    let state: SharedState = Arc::new(AppState {
        queue,
        handlers,
        config,
    });

    let app = Router::new()
        .merge(routes::api_routes())
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (app, state)
}

async fn health() -> &'static str {
    "ok"
}
