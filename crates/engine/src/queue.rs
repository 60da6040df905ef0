//! Dispatch queue protocol — primary FIFO queue plus a time-ordered delayed queue.
//!
//! - Primary queue: `LPUSH` to enqueue, `BRPOP` with a bounded wait to dequeue.
//! - Delayed queue: sorted set scored by due time (store clock, Unix millis).
//!   Each member wraps the serialized message together with a
//!   `trace_id:retry_count` key so two otherwise identical retries stay
//!   distinct members.
//!
//! [`DispatchQueue::promote_due`] moves due entries to the primary queue. The
//! push and the removal are batched but not transactional, so a crash between
//! them can deliver an entry twice. That is within the at-least-once contract.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::AlarmMessage;

use crate::store::AlarmStore;

/// Delayed queue member: the message plus its disambiguating key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedEntry {
    pub key: String,
    pub message: AlarmMessage,
}

impl DelayedEntry {
    pub fn new(message: AlarmMessage) -> Self {
        Self {
            key: format!("{}:{}", message.trace_id(), message.retry_count),
            message,
        }
    }
}

/// Why a dequeue produced no message.
#[derive(Debug, Error)]
pub enum DequeueError {
    /// The store could not be reached; callers should back off.
    #[error("Store error: {0}")]
    Store(AppError),

    /// An entry was popped but could not be decoded. It is gone.
    #[error("Malformed queue entry: {0}")]
    Malformed(serde_json::Error),
}

pub fn primary_queue_key(service_name: &str) -> String {
    format!("{}:alarm:message:queue", service_name)
}

pub fn delayed_queue_key(service_name: &str) -> String {
    format!("{}:alarm:message:delay_queue", service_name)
}

/// Primary + delayed queues for one service.
#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn AlarmStore>,
    primary_key: String,
    delayed_key: String,
    dequeue_timeout: Duration,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn AlarmStore>, service_name: &str, dequeue_timeout: Duration) -> Self {
        Self {
            store,
            primary_key: primary_queue_key(service_name),
            delayed_key: delayed_queue_key(service_name),
            dequeue_timeout,
        }
    }

    /// Append a message to the primary queue.
    pub async fn enqueue(&self, message: &AlarmMessage) -> Result<(), AppError> {
        let payload = serde_json::to_string(message)?;
        self.store.lpush(&self.primary_key, &payload).await
    }

    /// Wait up to the dequeue timeout for the next message. `Ok(None)` on timeout.
    pub async fn dequeue(&self) -> Result<Option<AlarmMessage>, DequeueError> {
        let Some(payload) = self
            .store
            .brpop(&self.primary_key, self.dequeue_timeout)
            .await
            .map_err(DequeueError::Store)?
        else {
            return Ok(None);
        };

        serde_json::from_str(&payload)
            .map(Some)
            .map_err(DequeueError::Malformed)
    }

    /// Schedule a message to re-enter the primary queue after `delay`.
    pub async fn enqueue_delayed(&self, message: &AlarmMessage, delay: Duration) -> Result<(), AppError> {
        let member = serde_json::to_string(&DelayedEntry::new(message.clone()))?;
        let due_at = self.store.now_millis().await? + delay.as_millis() as i64;
        self.store.zadd(&self.delayed_key, due_at, &member).await
    }

    /// Move up to `batch_limit` due delayed entries to the primary queue.
    /// Returns how many were moved; undecodable entries are dropped.
    pub async fn promote_due(&self, batch_limit: usize) -> Result<usize, AppError> {
        let now = self.store.now_millis().await?;
        let members = self
            .store
            .zrange_by_score(&self.delayed_key, now, batch_limit)
            .await?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut moves = Vec::with_capacity(members.len());
        let mut discard = Vec::new();
        for member in members {
            let payload = serde_json::from_str::<DelayedEntry>(&member)
                .and_then(|entry| serde_json::to_string(&entry.message));
            match payload {
                Ok(payload) => moves.push((member, payload)),
                Err(e) => {
                    tracing::warn!(error = %e, member = %member, "Dropping invalid delayed alarm entry");
                    discard.push(member);
                }
            }
        }

        self.store
            .move_to_list(&self.delayed_key, &self.primary_key, &moves, &discard)
            .await?;

        if !moves.is_empty() {
            tracing::info!(count = moves.len(), "Promoted delayed alarm messages");
        }
        Ok(moves.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use herald_common::types::AlarmTextMessage;

    fn message(trace_id: &str, retry_count: u32) -> AlarmMessage {
        AlarmMessage {
            platform: "ops".to_string(),
            text: AlarmTextMessage {
                trace_id: trace_id.to_string(),
                operation: "Job.Run".to_string(),
                title: "[ops] [DEV] job failed".to_string(),
                info: "exit code 1".to_string(),
            },
            retry_count,
            max_retry: 3,
        }
    }

    fn queue(store: Arc<MemoryStore>) -> DispatchQueue {
        DispatchQueue::new(store, "svc", Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(store);
        let msg = message("t-1", 0);

        q.enqueue(&msg).await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn test_dequeue_timeout_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        assert_eq!(queue(store).dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.lpush(&primary_queue_key("svc"), "{oops").await.unwrap();
        let err = queue(store).dequeue().await.unwrap_err();
        assert!(matches!(err, DequeueError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_identical_retries_are_distinct_members() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(store.clone());

        q.enqueue_delayed(&message("t-1", 1), Duration::from_secs(1)).await.unwrap();
        q.enqueue_delayed(&message("t-1", 2), Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.zset_len(&delayed_queue_key("svc")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_only_due_entries() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(store.clone());

        q.enqueue_delayed(&message("soon", 1), Duration::from_secs(1)).await.unwrap();
        q.enqueue_delayed(&message("later", 1), Duration::from_secs(10)).await.unwrap();
        assert_eq!(q.promote_due(100).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(q.promote_due(100).await.unwrap(), 1);
        assert_eq!(store.list_len(&primary_queue_key("svc")), 1);
        assert_eq!(store.zset_len(&delayed_queue_key("svc")), 1);

        let promoted = q.dequeue().await.unwrap().unwrap();
        assert_eq!(promoted.trace_id(), "soon");
        assert_eq!(promoted.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_respects_batch_limit() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(store.clone());

        for i in 0..5 {
            q.enqueue_delayed(&message(&format!("t-{}", i), 1), Duration::ZERO)
                .await
                .unwrap();
        }
        assert_eq!(q.promote_due(3).await.unwrap(), 3);
        assert_eq!(q.promote_due(3).await.unwrap(), 2);
        assert_eq!(store.zset_len(&delayed_queue_key("svc")), 0);
    }

    #[tokio::test]
    async fn test_promote_discards_invalid_members() {
        let store = Arc::new(MemoryStore::new());
        store.zadd(&delayed_queue_key("svc"), 0, "garbage").await.unwrap();
        let q = queue(store.clone());

        assert_eq!(q.promote_due(100).await.unwrap(), 0);
        assert_eq!(store.zset_len(&delayed_queue_key("svc")), 0);
        assert_eq!(store.list_len(&primary_queue_key("svc")), 0);
    }
}
