use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::QueueError;
use crate::models::QueueItem;
use crate::queue;
use crate::state::SharedState;

/// Start a worker pool on a dedicated Tokio runtime with its own thread pool.
/// This runs on a separate OS thread and blocks until shutdown is signaled.
pub fn run_pool(
    state: SharedState,
    shutdown: watch::Receiver<bool>,
    worker_count: usize,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("worker-pool".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(worker_count.max(1))
                .thread_name("event-worker")
                .enable_all()
                .build()
                .expect("Failed to build worker runtime");

            runtime.block_on(async {
                let mut handles = Vec::with_capacity(worker_count + 1);

                for id in 0..worker_count {
                    handles.push(tokio::spawn(run(id, state.clone(), shutdown.clone())));
                }

                if state.config.reclaim_enabled() {
                    handles.push(tokio::spawn(run_reclaimer(state.clone(), shutdown.clone())));
                }

                tracing::info!("Event worker pool started ({worker_count} workers)");

                for handle in handles {
                    let _ = handle.await;
                }

                tracing::info!("Event worker pool stopped");
            });
        })
        .expect("Failed to spawn worker pool thread")
}

/// A single worker loop that polls the queue and processes due batches.
pub async fn run(id: usize, state: SharedState, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("Worker {id} started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_batch(&state).await {
            Ok(0) => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("Worker {id} error: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(state.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::debug!("Worker {id} stopped");
}

/// Claim one batch of due items and run each through its handler. Returns the
/// number of items claimed.
///
/// Handler failures become state transitions. A store error while claiming is
/// returned; a store error while recording an outcome is logged and the item
/// stays `processing` until the reclaimer picks it up.
pub async fn process_batch(state: &SharedState) -> Result<usize, QueueError> {
    let batch = state
        .queue
        .select_due(state.queue.config().batch_limit, Utc::now())
        .await?;

    let claimed = batch.len();
    for item in batch {
        if let Err(e) = process_one(state, &item).await {
            match e {
                QueueError::StaleClaim { .. } => {
                    tracing::warn!(event_id = %item.id, "Claim is stale, item skipped");
                }
                e => {
                    tracing::error!(event_id = %item.id, "Failed to record outcome: {e}");
                }
            }
        }
    }

    Ok(claimed)
}

async fn process_one(state: &SharedState, item: &QueueItem) -> Result<QueueItem, QueueError> {
    tracing::debug!(
        event_id = %item.id,
        event_type = %item.event_type,
        attempt = item.retry_count + 1,
        "Processing event"
    );

    // The claim may have been reclaimed while this item waited in the batch.
    let item = &state.queue.begin(item, Utc::now()).await?;

    let outcome = queue::process(item, &state.handlers).await;
    let now = Utc::now();

    match outcome.into_failure() {
        None => state.queue.complete(item, now).await,
        Some(failure) => state.queue.fail(item, now, failure).await,
    }
}

/// Periodically reclaim items whose claim outlived the processing timeout.
pub async fn run_reclaimer(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let timeout = state.config.processing_timeout;
    let interval = reclaim_interval(timeout);
    tracing::debug!("Reclaimer started (timeout {timeout:?}, interval {interval:?})");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = state.queue.reclaim_stale(timeout, Utc::now()).await {
            tracing::error!("Reclaimer error: {e}");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::debug!("Reclaimer stopped");
}

fn reclaim_interval(timeout: Duration) -> Duration {
    timeout.clamp(Duration::from_secs(1), Duration::from_secs(30))
}

