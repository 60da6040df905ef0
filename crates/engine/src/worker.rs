//! Worker pool and delayed-queue promoter.
//!
//! A fixed number of workers drain the primary queue, each handling one
//! message at a time, plus exactly one promoter moving due retries back onto
//! the primary queue. Nothing is spawned per message.
//!
//! Shutdown cancels a shared token and waits on a task tracker. A worker
//! notices cancellation between iterations, so an in-flight send finishes
//! and a pending dequeue runs to its bounded timeout rather than being
//! dropped with a popped message in hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use herald_common::error::AppError;
use herald_common::types::AlarmMessage;
use herald_notifier::AlarmSender;

use crate::queue::{DequeueError, DispatchQueue};
use crate::retry::{self, DeliveryState};

/// Pause after a store error before the next dequeue.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Sends one message and routes failures through the retry state machine.
pub struct Delivery {
    queue: DispatchQueue,
    sender: Arc<dyn AlarmSender>,
    send_timeout: Duration,
}

impl Delivery {
    pub fn new(queue: DispatchQueue, sender: Arc<dyn AlarmSender>, send_timeout: Duration) -> Self {
        Self {
            queue,
            sender,
            send_timeout,
        }
    }

    /// Attempt delivery and return the state the message ends up in.
    pub async fn deliver(&self, mut message: AlarmMessage) -> DeliveryState {
        tracing::debug!(
            trace_id = %message.trace_id(),
            platform = %message.platform,
            retry = message.retry_count,
            state = ?DeliveryState::Sending,
            "Sending alarm message"
        );

        let result = match tokio::time::timeout(
            self.send_timeout,
            self.sender.send(&message.platform, &message.text),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "send did not complete within {}s",
                self.send_timeout.as_secs()
            ))),
        };

        if let Err(e) = result {
            tracing::error!(
                trace_id = %message.trace_id(),
                platform = %message.platform,
                title = %message.text.title,
                error = %e,
                "Alarm message delivery failed"
            );
            return self.handle_failure(&mut message).await;
        }

        tracing::info!(
            trace_id = %message.trace_id(),
            platform = %message.platform,
            "Alarm message delivered"
        );
        DeliveryState::Delivered
    }

    async fn handle_failure(&self, message: &mut AlarmMessage) -> DeliveryState {
        let state = retry::on_failure(message);
        match state {
            DeliveryState::RetryScheduled { retry_count, delay } => {
                tracing::info!(
                    trace_id = %message.trace_id(),
                    retry = retry_count,
                    max_retry = message.max_retry,
                    delay_secs = delay.as_secs(),
                    "Scheduling alarm message retry"
                );
                if let Err(e) = self.queue.enqueue_delayed(message, delay).await {
                    tracing::error!(
                        trace_id = %message.trace_id(),
                        error = %e,
                        "Failed to enqueue delayed alarm message"
                    );
                }
            }
            DeliveryState::Dropped => {
                tracing::warn!(
                    trace_id = %message.trace_id(),
                    max_retry = message.max_retry,
                    "Alarm message reached max retry limit, giving up"
                );
            }
            _ => {}
        }
        state
    }
}

/// Settings for [`WorkerPool::start`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub workers: usize,
    pub promote_interval: Duration,
    pub promote_batch: usize,
}

/// Fixed set of delivery workers plus the delayed-queue promoter.
pub struct WorkerPool {
    token: CancellationToken,
    tracker: TaskTracker,
    stopping: AtomicBool,
}

impl WorkerPool {
    /// Spawn the workers and the promoter on the current runtime.
    pub fn start(queue: DispatchQueue, delivery: Arc<Delivery>, settings: PoolSettings) -> Self {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        for id in 0..settings.workers {
            tracker.spawn(run_worker(id, queue.clone(), delivery.clone(), token.clone()));
        }
        tracker.spawn(run_promoter(
            queue,
            settings.promote_interval,
            settings.promote_batch,
            token.clone(),
        ));
        tracker.close();

        tracing::info!(workers = settings.workers, "Alarm worker pool started");

        Self {
            token,
            tracker,
            stopping: AtomicBool::new(false),
        }
    }

    /// Stop all workers and the promoter, waiting until each has exited.
    ///
    /// Safe to call more than once; every caller returns once the pool is down.
    pub async fn shutdown(&self) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!("Alarm worker pool stopping...");
            self.token.cancel();
        }

        self.tracker.wait().await;
        tracing::info!("Alarm worker pool stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Number of workers and promoter tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_worker(
    id: usize,
    queue: DispatchQueue,
    delivery: Arc<Delivery>,
    token: CancellationToken,
) {
    tracing::info!(worker = id, "Alarm worker started");

    while !token.is_cancelled() {
        match queue.dequeue().await {
            Ok(Some(message)) => {
                delivery.deliver(message).await;
            }
            Ok(None) => {}
            Err(DequeueError::Malformed(e)) => {
                tracing::warn!(worker = id, error = %e, "Skipping malformed alarm message");
            }
            Err(DequeueError::Store(e)) => {
                tracing::error!(worker = id, error = %e, "Alarm worker dequeue error");
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    tracing::info!(worker = id, "Alarm worker stopped");
}

async fn run_promoter(
    queue: DispatchQueue,
    interval: Duration,
    batch: usize,
    token: CancellationToken,
) {
    tracing::info!("Delayed queue promoter started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.promote_due(batch).await {
                    tracing::error!(error = %e, "Failed to promote delayed alarm messages");
                }
            }
        }
    }

    tracing::info!("Delayed queue promoter stopped");
}
