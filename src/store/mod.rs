//! Durable storage for queue items.
//!
//! Every mutation after insert is a single conditional update keyed on the
//! item's status and claim token, so a failed call never leaves a partial
//! transition behind and a stale claim holder can never overwrite newer state.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{EventStatus, QueueItem, StatusCounts};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("queue item {0} already exists")]
    Duplicate(Uuid),
}

/// A state change applied to a claimed (`processing`) item.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        processed_at: DateTime<Utc>,
    },
    /// Back to `pending`; the claim token is cleared.
    Requeue {
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
    Fail {
        retry_count: i32,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub status: Option<EventStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, item: &QueueItem) -> Result<QueueItem, StoreError>;

    /// Atomically select up to `limit` due pending items and move them to
    /// `processing` under `claim_token`. Returned oldest-due-first.
    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        claim_token: Uuid,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Apply `transition` only if the item is still `processing` under
    /// `claim_token`. Returns `None` when the condition did not hold.
    async fn apply(
        &self,
        id: Uuid,
        claim_token: Uuid,
        transition: &Transition,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Refresh `claimed_at` to `now` if the item is still `processing` under
    /// `claim_token`. Returns `None` when the claim is no longer current.
    async fn touch(
        &self,
        id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// `processing` items claimed at or before `claimed_before`, oldest claim first.
    async fn find_stale(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItem>, StoreError>;
}

/// Selection order: `scheduled_for`, then `created_at`, then `id`.
pub fn due_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    a.scheduled_for
        .cmp(&b.scheduled_for)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
