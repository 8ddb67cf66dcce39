mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use eventqueue::config::QueueConfig;
use eventqueue::error::QueueError;
use eventqueue::handlers::{HandlerError, HandlerRegistry};
use eventqueue::models::EventStatus;
use eventqueue::queue::{Failure, NewEvent, Queue};
use eventqueue::store::MemoryStore;
use eventqueue::worker;

fn memory_queue() -> (Queue, Arc<MemoryStore>) {
    let store = MemoryStore::arc();
    (Queue::new(store.clone(), QueueConfig::default()), store)
}

fn email() -> NewEvent {
    NewEvent::new("SEND_EMAIL", "billing", json!({ "to": "a@b.com" }))
}

// ── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn due_item_is_claimed_and_moved_to_processing() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    let item = queue
        .enqueue_at(email().scheduled_for(now - TimeDelta::seconds(1)), now)
        .await
        .unwrap();

    let batch: Vec<_> = queue.select_due(10, now).await.unwrap().collect();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, item.id);
    assert_eq!(batch[0].status, EventStatus::Processing);
    assert!(batch[0].claim_token.is_some());

    // Nothing left to claim.
    assert_eq!(queue.select_due(10, now).await.unwrap().len(), 0);
}

#[tokio::test]
async fn future_items_are_not_selected() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue
        .enqueue_at(email().scheduled_for(now + TimeDelta::seconds(30)), now)
        .await
        .unwrap();

    assert_eq!(queue.select_due(10, now).await.unwrap().len(), 0);
    assert_eq!(
        queue
            .select_due(10, now + TimeDelta::seconds(30))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn first_failure_requeues_with_backoff() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let item = queue.select_due(1, now).await.unwrap().next().unwrap();

    let failed_at = now + TimeDelta::seconds(1);
    let updated = queue
        .fail(&item, failed_at, Failure::transient("smtp timeout"))
        .await
        .unwrap();

    assert_eq!(updated.status, EventStatus::Pending);
    assert_eq!(updated.retry_count, 1);
    assert_eq!(updated.scheduled_for, failed_at + TimeDelta::milliseconds(2000));
    assert_eq!(updated.last_error.as_deref(), Some("smtp timeout"));
    assert_eq!(updated.claim_token, None);

    // Not due again until the backoff has elapsed.
    assert_eq!(queue.select_due(10, failed_at).await.unwrap().len(), 0);
    assert_eq!(
        queue
            .select_due(10, updated.scheduled_for)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn retries_are_exhausted_after_max_retries_attempts() {
    let (queue, _) = memory_queue();
    let mut now = Utc::now();
    let created = queue.enqueue_at(email(), now).await.unwrap();

    for attempt in 1..=3 {
        let item = queue.select_due(1, now).await.unwrap().next().unwrap();
        let updated = queue
            .fail(&item, now, Failure::transient(format!("attempt {attempt}")))
            .await
            .unwrap();
        assert_eq!(updated.retry_count, attempt);
        now = updated.scheduled_for;
    }

    let item = queue.get(created.id).await.unwrap();
    assert_eq!(item.status, EventStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert_eq!(item.last_error.as_deref(), Some("attempt 3"));

    // Terminal items are never selected again.
    let far_future = now + TimeDelta::days(365);
    assert_eq!(queue.select_due(10, far_future).await.unwrap().len(), 0);
}

#[tokio::test]
async fn permanent_failure_skips_remaining_retries() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email().max_retries(10), now).await.unwrap();
    let item = queue.select_due(1, now).await.unwrap().next().unwrap();

    let updated = queue
        .fail(&item, now, Failure::permanent("invalid address"))
        .await
        .unwrap();
    assert_eq!(updated.status, EventStatus::Failed);
    assert_eq!(updated.retry_count, 1);
}

#[tokio::test]
async fn complete_sets_processed_at_once() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let item = queue.select_due(1, now).await.unwrap().next().unwrap();

    let done_at = now + TimeDelta::milliseconds(150);
    let done = queue.complete(&item, done_at).await.unwrap();
    assert_eq!(done.status, EventStatus::Completed);
    assert_eq!(done.processed_at, Some(done_at));
    assert!(done.processed_at.unwrap() >= item.claimed_at.unwrap());

    // Repeating the call is a no-op.
    let again = queue
        .complete(&item, done_at + TimeDelta::seconds(5))
        .await
        .unwrap();
    assert_eq!(again.processed_at, Some(done_at));
}

#[tokio::test]
async fn processed_at_never_precedes_the_claim() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let item = queue.select_due(1, now).await.unwrap().next().unwrap();

    // A caller clock running behind the claim time.
    let done = queue
        .complete(&item, now - TimeDelta::seconds(2))
        .await
        .unwrap();
    assert_eq!(done.status, EventStatus::Completed);
    assert_eq!(done.processed_at, item.claimed_at);
}

#[tokio::test]
async fn stale_claim_cannot_complete_a_requeued_item() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let first_claim = queue.select_due(1, now).await.unwrap().next().unwrap();

    let requeued = queue
        .fail(&first_claim, now, Failure::transient("timeout"))
        .await
        .unwrap();
    let second_claim = queue
        .select_due(1, requeued.scheduled_for)
        .await
        .unwrap()
        .next()
        .unwrap();
    assert_ne!(first_claim.claim_token, second_claim.claim_token);

    let err = queue.complete(&first_claim, now).await.unwrap_err();
    assert!(matches!(err, QueueError::StaleClaim { .. }));

    let err = queue
        .fail(&first_claim, now, Failure::permanent("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::StaleClaim { .. }));

    let current = queue.get(second_claim.id).await.unwrap();
    assert_eq!(current.status, EventStatus::Processing);
    assert_eq!(current.claim_token, second_claim.claim_token);
}

#[tokio::test]
async fn batch_is_oldest_due_first_and_respects_limit() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    for secs in [5, 30, 10, 20] {
        queue
            .enqueue_at(
                NewEvent::new("tick", "clock", json!({ "secs": secs }))
                    .scheduled_for(now - TimeDelta::seconds(secs)),
                now,
            )
            .await
            .unwrap();
    }

    let batch: Vec<i64> = queue
        .select_due(3, now)
        .await
        .unwrap()
        .map(|item| item.payload["secs"].as_i64().unwrap())
        .collect();
    assert_eq!(batch, vec![30, 20, 10]);
}

#[tokio::test]
async fn store_error_leaves_item_unchanged() {
    let (queue, store) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let item = queue.select_due(1, now).await.unwrap().next().unwrap();

    store.set_unavailable(true);
    let err = queue.complete(&item, now).await.unwrap_err();
    assert!(matches!(err, QueueError::Store(_)));
    store.set_unavailable(false);

    let current = queue.get(item.id).await.unwrap();
    assert_eq!(current.status, EventStatus::Processing);
    assert_eq!(current.processed_at, None);
}

// ── Concurrency ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_selectors_never_share_items() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    for n in 0..200 {
        queue
            .enqueue_at(NewEvent::new("tick", "clock", json!({ "n": n })), now)
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch: Vec<Uuid> = queue
                    .select_due(7, now)
                    .await
                    .unwrap()
                    .map(|item| item.id)
                    .collect();
                if batch.is_empty() {
                    break;
                }
                ids.extend(batch);
                tokio::task::yield_now().await;
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for id in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(total, 200);
}

// ── Reclaim ─────────────────────────────────────────────────────

#[tokio::test]
async fn stuck_claims_are_reclaimed_through_the_retry_path() {
    let (queue, _) = memory_queue();
    let now = Utc::now();
    queue.enqueue_at(email(), now).await.unwrap();
    let abandoned = queue.select_due(1, now).await.unwrap().next().unwrap();

    let timeout = Duration::from_secs(60);
    assert_eq!(queue.reclaim_stale(timeout, now + TimeDelta::seconds(59)).await.unwrap(), 0);

    let later = now + TimeDelta::seconds(61);
    assert_eq!(queue.reclaim_stale(timeout, later).await.unwrap(), 1);

    let item = queue.get(abandoned.id).await.unwrap();
    assert_eq!(item.status, EventStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.last_error.as_deref(), Some("processing timed out"));
    assert!(item.scheduled_for > later);

    // The abandoned worker can no longer record an outcome.
    let err = queue.complete(&abandoned, later).await.unwrap_err();
    assert!(matches!(err, QueueError::StaleClaim { .. }));
}

// ── Worker ──────────────────────────────────────────────────────

#[tokio::test]
async fn item_reclaimed_while_waiting_in_a_batch_is_not_handled() {
    let late_calls = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    });
    handlers.register_fn("waiting", {
        let late_calls = late_calls.clone();
        move |_| {
            let late_calls = late_calls.clone();
            async move {
                late_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });

    let app = common::spawn_app(handlers).await;
    let queue = &app.state.queue;
    let now = Utc::now();
    queue
        .enqueue_at(
            NewEvent::new("slow", "tests", json!({})).scheduled_for(now - TimeDelta::seconds(2)),
            now,
        )
        .await
        .unwrap();
    let waiting = queue
        .enqueue_at(
            NewEvent::new("waiting", "tests", json!({})).scheduled_for(now - TimeDelta::seconds(1)),
            now,
        )
        .await
        .unwrap();

    let first_worker = tokio::spawn({
        let state = app.state.clone();
        async move { worker::process_batch(&state).await }
    });

    // While the slow item runs, both claims time out and a second worker
    // picks the items up again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.reclaim_stale(Duration::ZERO, Utc::now()).await.unwrap(), 2);
    let second_claim: Vec<_> = queue
        .select_due(10, Utc::now() + TimeDelta::hours(1))
        .await
        .unwrap()
        .collect();
    assert_eq!(second_claim.len(), 2);

    assert_eq!(first_worker.await.unwrap().unwrap(), 2);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);

    let current = queue.get(waiting.id).await.unwrap();
    assert_eq!(current.status, EventStatus::Processing);
    let reclaimed = second_claim.iter().find(|i| i.id == waiting.id).unwrap();
    assert_eq!(current.claim_token, reclaimed.claim_token);
}

#[tokio::test]
async fn worker_batch_routes_outcomes_to_transitions() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("ok", |_| async { Ok(()) });
    handlers.register_fn("flaky", {
        let calls = calls.clone();
        move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::from("upstream returned 503"))
            }
        }
    });
    handlers.register_fn("bad", |_| async { Err(HandlerError::permanent("malformed")) });

    let app = common::spawn_app(handlers).await;
    let queue = &app.state.queue;
    let ok = queue.enqueue(NewEvent::new("ok", "tests", json!({}))).await.unwrap();
    let flaky = queue.enqueue(NewEvent::new("flaky", "tests", json!({}))).await.unwrap();
    let bad = queue.enqueue(NewEvent::new("bad", "tests", json!({}))).await.unwrap();

    assert_eq!(worker::process_batch(&app.state).await.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ok = queue.get(ok.id).await.unwrap();
    assert_eq!(ok.status, EventStatus::Completed);
    assert!(ok.processed_at.is_some());

    let flaky = queue.get(flaky.id).await.unwrap();
    assert_eq!(flaky.status, EventStatus::Pending);
    assert_eq!(flaky.retry_count, 1);
    assert!(flaky.scheduled_for > Utc::now());

    let bad = queue.get(bad.id).await.unwrap();
    assert_eq!(bad.status, EventStatus::Failed);
    assert_eq!(bad.last_error.as_deref(), Some("malformed"));

    // The re-queued item is not due yet.
    assert_eq!(worker::process_batch(&app.state).await.unwrap(), 0);
}

#[tokio::test]
async fn worker_pool_drains_queue_and_stops_on_shutdown() {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("ok", |_| async { Ok(()) });

    let app = common::spawn_app(handlers).await;
    for _ in 0..25 {
        app.state
            .queue
            .enqueue(NewEvent::new("ok", "tests", json!({})))
            .await
            .unwrap();
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = worker::run_pool(app.state.clone(), shutdown_rx, 2);

    let mut completed = 0;
    for _ in 0..200 {
        completed = app.state.queue.stats().await.unwrap().completed;
        if completed == 25 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(completed, 25);

    shutdown_tx.send(true).unwrap();
    tokio::task::spawn_blocking(move || pool.join())
        .await
        .unwrap()
        .unwrap();
}
