//! Enqueue, claim, complete, and fail queue items.
//!
//! `Queue` holds no authoritative state of its own; every operation is one
//! store call (or one conditional update plus a read to explain a miss).

pub mod processor;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::models::{EventStatus, NewQueueItem, QueueItem, StatusCounts};
use crate::store::{ListFilter, QueueStore, Transition};

pub use processor::{process, Outcome};
pub use retry::{plan_failure, Backoff, Failure};

/// An enqueue request as a producer sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_source: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_source: event_source.into(),
            payload,
            scheduled_for: None,
            max_retries: None,
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Items claimed by one `select_due` call, oldest-due-first. Consumed once.
#[derive(Debug)]
pub struct ClaimedBatch {
    items: std::vec::IntoIter<QueueItem>,
}

impl ClaimedBatch {
    fn new(items: Vec<QueueItem>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for ClaimedBatch {
    type Item = QueueItem;

    fn next(&mut self) -> Option<QueueItem> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for ClaimedBatch {}

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    backoff: Backoff,
}

impl Queue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        let backoff = Backoff::new(config.base_delay_ms);
        Self {
            store,
            config,
            backoff,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, event: NewEvent) -> Result<QueueItem, QueueError> {
        self.enqueue_at(event, Utc::now()).await
    }

    /// Enqueue with an explicit clock; `scheduled_for` defaults to `now`.
    pub async fn enqueue_at(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let new = self.validate(event, now)?;
        let item = self.store.insert(&QueueItem::pending(new, now)).await?;

        tracing::debug!(
            event_id = %item.id,
            event_type = %item.event_type,
            event_source = %item.event_source,
            scheduled_for = %item.scheduled_for,
            "Event enqueued"
        );
        Ok(item)
    }

    fn validate(&self, event: NewEvent, now: DateTime<Utc>) -> Result<NewQueueItem, QueueError> {
        let event_type = event.event_type.trim();
        if event_type.is_empty() {
            return Err(QueueError::Validation("event_type is required".to_string()));
        }
        let event_source = event.event_source.trim();
        if event_source.is_empty() {
            return Err(QueueError::Validation("event_source is required".to_string()));
        }

        let max_retries = event.max_retries.unwrap_or(self.config.default_max_retries);
        if max_retries < 1 {
            return Err(QueueError::Validation(format!(
                "max_retries must be at least 1, got {max_retries}"
            )));
        }

        Ok(NewQueueItem {
            event_type: event_type.to_string(),
            event_source: event_source.to_string(),
            payload: event.payload,
            scheduled_for: event.scheduled_for.unwrap_or(now),
            max_retries,
        })
    }

    /// Claim up to `limit` due items. Each returned item is `processing` and
    /// owned by the caller until it is completed or failed.
    pub async fn select_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<ClaimedBatch, QueueError> {
        if limit == 0 {
            return Ok(ClaimedBatch::empty());
        }

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let items = self.store.claim_due(limit, now, Uuid::now_v7()).await?;
        if !items.is_empty() {
            tracing::debug!(count = items.len(), "Claimed due events");
        }
        Ok(ClaimedBatch::new(items))
    }

    /// Confirm the claim on `item` is still current right before its handler
    /// runs, restarting the processing timeout from `now`.
    pub async fn begin(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let token = item.claim_token.ok_or(QueueError::NotClaimed { id: item.id })?;

        match self.store.touch(item.id, token, now).await? {
            Some(current) => Ok(current),
            None => match self.store.get(item.id).await? {
                Some(_) => Err(QueueError::StaleClaim { id: item.id }),
                None => Err(QueueError::NotFound(item.id)),
            },
        }
    }

    /// Mark a claimed item completed. Repeating the call for the same claim
    /// returns the stored item unchanged.
    pub async fn complete(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let token = item.claim_token.ok_or(QueueError::NotClaimed { id: item.id })?;
        // Never earlier than the moment processing began.
        let processed_at = item.claimed_at.map_or(now, |began| now.max(began));
        let transition = Transition::Complete { processed_at };

        if let Some(done) = self.store.apply(item.id, token, &transition).await? {
            tracing::debug!(event_id = %done.id, event_type = %done.event_type, "Event completed");
            return Ok(done);
        }

        match self.store.get(item.id).await? {
            Some(current)
                if current.status == EventStatus::Completed
                    && current.claim_token == Some(token) =>
            {
                Ok(current)
            }
            Some(_) => Err(QueueError::StaleClaim { id: item.id }),
            None => Err(QueueError::NotFound(item.id)),
        }
    }

    /// Record a failed attempt: re-queue with backoff or fail terminally.
    pub async fn fail(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
        failure: Failure,
    ) -> Result<QueueItem, QueueError> {
        let token = item.claim_token.ok_or(QueueError::NotClaimed { id: item.id })?;
        let transition = plan_failure(item, now, &failure, self.backoff);

        let Some(updated) = self.store.apply(item.id, token, &transition).await? else {
            return match self.store.get(item.id).await? {
                Some(_) => Err(QueueError::StaleClaim { id: item.id }),
                None => Err(QueueError::NotFound(item.id)),
            };
        };

        match updated.status {
            EventStatus::Failed => tracing::warn!(
                event_id = %updated.id,
                event_type = %updated.event_type,
                retry_count = updated.retry_count,
                error = %failure.reason(),
                "Event failed permanently"
            ),
            _ => tracing::debug!(
                event_id = %updated.id,
                event_type = %updated.event_type,
                retry_count = updated.retry_count,
                scheduled_for = %updated.scheduled_for,
                error = %failure.reason(),
                "Event re-queued"
            ),
        }
        Ok(updated)
    }

    /// Treat claims older than `timeout` as transient failures. Returns how
    /// many items were reclaimed; claims resolved concurrently are skipped.
    pub async fn reclaim_stale(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        let claimed_before = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = i64::try_from(self.config.batch_limit.max(1)).unwrap_or(i64::MAX);

        let stale = self.store.find_stale(claimed_before, limit).await?;
        let mut reclaimed = 0;
        for item in &stale {
            match self
                .fail(item, now, Failure::transient("processing timed out"))
                .await
            {
                Ok(_) => reclaimed += 1,
                Err(QueueError::StaleClaim { .. }) => {
                    tracing::debug!(event_id = %item.id, "Claim resolved before reclaim");
                }
                Err(e) => return Err(e),
            }
        }

        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, "Reclaimed stuck events");
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: Uuid) -> Result<QueueItem, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    pub async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let filter = ListFilter {
            status,
            limit,
            offset,
        };
        Ok(self.store.list(&filter).await?)
    }

    pub async fn stats(&self) -> Result<StatusCounts, QueueError> {
        Ok(self.store.counts().await?)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
