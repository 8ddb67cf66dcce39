use std::sync::Arc;

use crate::config::Config;
use crate::handlers::HandlerRegistry;
use crate::queue::Queue;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub queue: Queue,
    pub handlers: HandlerRegistry,
    pub config: Config,
}
