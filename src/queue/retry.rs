//! Failure state machine and exponential backoff.

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::QueueItem;
use crate::store::Transition;

/// Why an attempt failed, as far as retrying is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Transient(String),
    Permanent(String),
}

impl Failure {
    pub fn transient(reason: impl Into<String>) -> Self {
        Failure::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Failure::Permanent(reason.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            Failure::Transient(reason) | Failure::Permanent(reason) => reason,
        }
    }
}

/// `delay(n) = base × 2^n`, saturating instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
}

impl Backoff {
    /// A zero base is raised to 1ms so a retry always lands in the future.
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms: base_ms.max(1),
        }
    }

    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        2u64.checked_pow(retry_count)
            .and_then(|factor| self.base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
    }

    pub fn delay(&self, retry_count: u32) -> TimeDelta {
        let ms = i64::try_from(self.delay_ms(retry_count)).unwrap_or(i64::MAX);
        TimeDelta::try_milliseconds(ms).unwrap_or(TimeDelta::MAX)
    }

    /// `now + delay(retry_count)`, clamped to the latest representable instant.
    pub fn next_attempt(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        now.checked_add_signed(self.delay(retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Decide what a failed attempt does to `item`.
///
/// Transient failures re-queue while `retry_count + 1 < max_retries`,
/// scheduled `delay(new retry_count)` after `now`; otherwise, and for every
/// permanent failure, the item fails terminally. `retry_count` never exceeds
/// `max_retries`.
pub fn plan_failure(
    item: &QueueItem,
    now: DateTime<Utc>,
    failure: &Failure,
    backoff: Backoff,
) -> Transition {
    let attempts = item.retry_count.saturating_add(1);
    let retry_count = attempts.min(item.max_retries);
    let error = failure.reason().to_string();

    match failure {
        Failure::Transient(_) if attempts < item.max_retries => Transition::Requeue {
            retry_count,
            scheduled_for: backoff.next_attempt(now, retry_count.unsigned_abs()),
            error,
        },
        _ => Transition::Fail { retry_count, error },
    }
}
