use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventStatus, QueueItem, StatusCounts};

use super::{due_order, ListFilter, QueueStore, StoreError, Transition};

/// PostgreSQL-backed queue store over the `event_queue` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn insert(&self, item: &QueueItem) -> Result<QueueItem, StoreError> {
        let row = sqlx::query_as::<_, QueueItem>(
            "INSERT INTO event_queue
                 (id, event_type, event_source, payload, status, scheduled_for,
                  retry_count, max_retries, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(item.id)
        .bind(&item.event_type)
        .bind(&item.event_source)
        .bind(&item.payload)
        .bind(item.status)
        .bind(item.scheduled_for)
        .bind(item.retry_count)
        .bind(item.max_retries)
        .bind(item.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                StoreError::Duplicate(item.id)
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(row)
    }

    /// Claim due items with SELECT FOR UPDATE SKIP LOCKED, so concurrent
    /// claimers skip each other's rows instead of blocking or double-claiming.
    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        claim_token: Uuid,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut rows = sqlx::query_as::<_, QueueItem>(
            "UPDATE event_queue AS q
             SET status = 'processing', claim_token = $3, claimed_at = $1
             FROM (
                 SELECT id FROM event_queue
                 WHERE status = 'pending'
                   AND scheduled_for <= $1
                 ORDER BY scheduled_for ASC, created_at ASC, id ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             ) AS due
             WHERE q.id = due.id
             RETURNING q.*",
        )
        .bind(now)
        .bind(limit)
        .bind(claim_token)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE ... RETURNING does not preserve the subquery order.
        rows.sort_by(due_order);
        Ok(rows)
    }

    async fn apply(
        &self,
        id: Uuid,
        claim_token: Uuid,
        transition: &Transition,
    ) -> Result<Option<QueueItem>, StoreError> {
        let row = match transition {
            Transition::Complete { processed_at } => {
                sqlx::query_as::<_, QueueItem>(
                    "UPDATE event_queue
                     SET status = 'completed', processed_at = $3
                     WHERE id = $1 AND status = 'processing' AND claim_token = $2
                     RETURNING *",
                )
                .bind(id)
                .bind(claim_token)
                .bind(processed_at)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Requeue {
                retry_count,
                scheduled_for,
                error,
            } => {
                sqlx::query_as::<_, QueueItem>(
                    "UPDATE event_queue
                     SET status = 'pending',
                         retry_count = $3,
                         scheduled_for = $4,
                         last_error = $5,
                         claim_token = NULL,
                         claimed_at = NULL
                     WHERE id = $1 AND status = 'processing' AND claim_token = $2
                     RETURNING *",
                )
                .bind(id)
                .bind(claim_token)
                .bind(retry_count)
                .bind(scheduled_for)
                .bind(error)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Fail { retry_count, error } => {
                sqlx::query_as::<_, QueueItem>(
                    "UPDATE event_queue
                     SET status = 'failed', retry_count = $3, last_error = $4
                     WHERE id = $1 AND status = 'processing' AND claim_token = $2
                     RETURNING *",
                )
                .bind(id)
                .bind(claim_token)
                .bind(retry_count)
                .bind(error)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }

    async fn touch(
        &self,
        id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query_as::<_, QueueItem>(
            "UPDATE event_queue SET claimed_at = $3
             WHERE id = $1 AND status = 'processing' AND claim_token = $2
             RETURNING *",
        )
        .bind(id)
        .bind(claim_token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query_as::<_, QueueItem>("SELECT * FROM event_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM event_queue
             WHERE ($1::event_status IS NULL OR status = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query_as::<_, (EventStatus, i64)>(
            "SELECT status, COUNT(*) FROM event_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status, n);
        }
        Ok(counts)
    }

    async fn find_stale(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM event_queue
             WHERE status = 'processing' AND claimed_at <= $1
             ORDER BY claimed_at ASC
             LIMIT $2",
        )
        .bind(claimed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
