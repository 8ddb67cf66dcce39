pub mod queue_item;

pub use queue_item::{EventStatus, NewQueueItem, QueueItem, StatusCounts};
