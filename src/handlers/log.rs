use async_trait::async_trait;

use super::{EventHandler, HandlerError};
use crate::models::QueueItem;

/// Records the event in the service log and succeeds. Useful as a sink for
/// event types that only need an audit trail.
pub struct LogHandler {
    event_type: String,
}

impl LogHandler {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
        }
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError> {
        tracing::info!(
            event_id = %item.id,
            event_type = %item.event_type,
            event_source = %item.event_source,
            payload = %item.payload,
            "Event received"
        );
        Ok(())
    }
}
