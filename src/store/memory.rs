//! In-process queue store for tests, development, and embedded use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{EventStatus, QueueItem, StatusCounts};

use super::{due_order, ListFilter, QueueStore, StoreError, Transition};

/// All reads and writes go through one lock, which makes claim and
/// conditional update atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<Uuid, QueueItem>>,
    outage: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// While set, every call fails with `StoreError::Unavailable` and nothing
    /// is read or written.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.outage.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, QueueItem>>, StoreError> {
        self.check_available()?;
        self.items
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, QueueItem>>, StoreError> {
        self.check_available()?;
        self.items
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert(&self, item: &QueueItem) -> Result<QueueItem, StoreError> {
        let mut items = self.write()?;
        if items.contains_key(&item.id) {
            return Err(StoreError::Duplicate(item.id));
        }
        items.insert(item.id, item.clone());
        Ok(item.clone())
    }

    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        claim_token: Uuid,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self.write()?;

        let mut due: Vec<&QueueItem> = items.values().filter(|item| item.is_due(now)).collect();
        due.sort_by(|a, b| due_order(a, b));
        let ids: Vec<Uuid> = due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|item| item.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = items.get_mut(&id) {
                item.status = EventStatus::Processing;
                item.claim_token = Some(claim_token);
                item.claimed_at = Some(now);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn apply(
        &self,
        id: Uuid,
        claim_token: Uuid,
        transition: &Transition,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut items = self.write()?;
        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };
        if item.status != EventStatus::Processing || item.claim_token != Some(claim_token) {
            return Ok(None);
        }

        match transition {
            Transition::Complete { processed_at } => {
                item.status = EventStatus::Completed;
                item.processed_at = Some(*processed_at);
            }
            Transition::Requeue {
                retry_count,
                scheduled_for,
                error,
            } => {
                item.status = EventStatus::Pending;
                item.retry_count = *retry_count;
                item.scheduled_for = *scheduled_for;
                item.last_error = Some(error.clone());
                item.claim_token = None;
                item.claimed_at = None;
            }
            Transition::Fail { retry_count, error } => {
                item.status = EventStatus::Failed;
                item.retry_count = *retry_count;
                item.last_error = Some(error.clone());
            }
        }
        Ok(Some(item.clone()))
    }

    async fn touch(
        &self,
        id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut items = self.write()?;
        match items.get_mut(&id) {
            Some(item)
                if item.status == EventStatus::Processing
                    && item.claim_token == Some(claim_token) =>
            {
                item.claimed_at = Some(now);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.read()?;
        let mut matching: Vec<&QueueItem> = items
            .values()
            .filter(|item| filter.status.is_none_or(|status| item.status == status))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let items = self.read()?;
        let mut counts = StatusCounts::default();
        for item in items.values() {
            counts.add(item.status, 1);
        }
        Ok(counts)
    }

    async fn find_stale(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.read()?;
        let mut stale: Vec<&QueueItem> = items
            .values()
            .filter(|item| {
                item.status == EventStatus::Processing
                    && item.claimed_at.is_some_and(|at| at <= claimed_before)
            })
            .collect();
        stale.sort_by_key(|item| item.claimed_at);

        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
