use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a queue item.
///
/// `Retry` exists for rows written by older producers; this crate re-queues
/// into `Pending` and never writes `Retry` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Completed,
        EventStatus::Failed,
        EventStatus::Retry,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub event_type: String,
    pub event_source: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub scheduled_for: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Build a fresh pending row. Validation happens in `Queue::enqueue`.
    pub fn pending(new: NewQueueItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: new.event_type,
            event_source: new.event_source,
            payload: new.payload,
            status: EventStatus::Pending,
            scheduled_for: new.scheduled_for,
            retry_count: 0,
            max_retries: new.max_retries,
            processed_at: None,
            created_at: now,
            claim_token: None,
            claimed_at: None,
            last_error: None,
        }
    }

    /// Eligible for selection at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.scheduled_for <= now
    }
}

/// A validated insert, ready for the store.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub event_type: String,
    pub event_source: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub max_retries: i32,
}

/// Count of items per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: i64) {
        match status {
            EventStatus::Pending => self.pending += n,
            EventStatus::Processing => self.processing += n,
            EventStatus::Completed => self.completed += n,
            EventStatus::Failed => self.failed += n,
            EventStatus::Retry => self.retry += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.retry
    }
}
