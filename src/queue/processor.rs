use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::handlers::{FailureKind, HandlerRegistry};
use crate::models::QueueItem;

use super::retry::Failure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl Outcome {
    /// `None` for success.
    pub fn into_failure(self) -> Option<Failure> {
        match self {
            Outcome::Success => None,
            Outcome::TransientFailure(reason) => Some(Failure::Transient(reason)),
            Outcome::PermanentFailure(reason) => Some(Failure::Permanent(reason)),
        }
    }
}

/// Run the handler registered for `item.event_type`.
///
/// A missing handler is a permanent failure. A panicking handler counts as a
/// transient failure. No timeout is applied here.
pub async fn process(item: &QueueItem, handlers: &HandlerRegistry) -> Outcome {
    let Some(handler) = handlers.get(&item.event_type) else {
        return Outcome::PermanentFailure(format!(
            "No handler registered for event type: {}",
            item.event_type
        ));
    };

    match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(e)) => match e.kind {
            FailureKind::Transient => Outcome::TransientFailure(e.message),
            FailureKind::Permanent => Outcome::PermanentFailure(e.message),
        },
        Err(panic) => Outcome::TransientFailure(format!(
            "Handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
