//! Fuse controller — time-boxed suppression of alarms that repeat too often.
//!
//! For an alarm text matched by a filter rule, three keys in the shared store
//! track its state, all derived from the SHA-256 of the text:
//! - `exist`: marks an open cooldown window (TTL = cooldown window)
//! - `times`: repeat counter within that window
//! - `fuse`:  present while the alarm is suppressed (TTL = fuse duration)
//!
//! When the counter reaches the rule's threshold it is reset and the fuse is
//! set; that occurrence and every later one are dropped until the fuse
//! expires. The fuse flag is consulted for every alarm, matched or not.
//!
//! Increments are atomic in the store, but read-then-fuse is not: callers
//! racing at the threshold may both set the fuse (idempotent) and both
//! deliver. Store errors fail open toward delivery.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use herald_common::error::AppError;

use crate::classifier::{Classification, MessageClassifier};
use crate::store::AlarmStore;

/// Whether an alarm should continue to the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseDecision {
    Enqueue,
    Suppress,
}

/// Stable dedup key for an alarm text.
pub fn message_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

pub fn exist_key(service_name: &str, hash: &str) -> String {
    format!("{}:alarm:exist:{}", service_name, hash)
}

pub fn times_key(service_name: &str, hash: &str) -> String {
    format!("{}:alarm:times:{}", service_name, hash)
}

pub fn fuse_key(service_name: &str, hash: &str) -> String {
    format!("{}:alarm:fuse:{}", service_name, hash)
}

pub struct FuseController {
    store: Arc<dyn AlarmStore>,
    classifier: MessageClassifier,
    cooldown_window: Duration,
    fuse_duration: Duration,
}

impl FuseController {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        classifier: MessageClassifier,
        cooldown_window: Duration,
        fuse_duration: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            cooldown_window,
            fuse_duration,
        }
    }

    /// Decide whether `message` from `service_name` is delivered or suppressed.
    pub async fn admit(&self, service_name: &str, message: &str) -> FuseDecision {
        let hash = message_hash(message);

        if let Classification::Matched { threshold } =
            self.classifier.classify(service_name, message).await
        {
            if self.is_fused(service_name, &hash).await {
                tracing::debug!(service = service_name, hash = %hash, "Alarm suppressed, fuse active");
                return FuseDecision::Suppress;
            }
            self.count_repeat(service_name, &hash, threshold).await;
        }

        if self.is_fused(service_name, &hash).await {
            tracing::debug!(service = service_name, hash = %hash, "Alarm suppressed, fuse active");
            return FuseDecision::Suppress;
        }

        FuseDecision::Enqueue
    }

    /// Count one more occurrence and blow the fuse once the threshold is reached.
    async fn count_repeat(&self, service_name: &str, hash: &str, threshold: i64) {
        let count = match self.increment(service_name, hash).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(service = service_name, error = %e, "Failed to count alarm repeat");
                return;
            }
        };

        if count < threshold {
            return;
        }

        // Restart the window and suppress for the fuse duration
        let times = times_key(service_name, hash);
        if let Err(e) = self.store.set_ex(&times, "0", self.cooldown_window).await {
            tracing::error!(service = service_name, error = %e, "Failed to reset alarm repeat counter");
        }
        match self
            .store
            .set_nx_ex(&fuse_key(service_name, hash), "1", self.fuse_duration)
            .await
        {
            Ok(_) => tracing::info!(
                service = service_name,
                hash = %hash,
                repeats = count,
                threshold,
                fuse_secs = self.fuse_duration.as_secs(),
                "Alarm fused"
            ),
            Err(e) => {
                tracing::error!(service = service_name, error = %e, "Failed to set alarm fuse")
            }
        }
    }

    /// Repeat count including this occurrence.
    ///
    /// A fresh window (no `exist` marker) starts the counter at 1; inside a
    /// window the counter is incremented atomically.
    async fn increment(&self, service_name: &str, hash: &str) -> Result<i64, AppError> {
        let exist = exist_key(service_name, hash);
        let times = times_key(service_name, hash);

        if self.store.set_nx_ex(&exist, "1", self.cooldown_window).await? {
            self.store.set_ex(&times, "1", self.cooldown_window).await?;
            return Ok(1);
        }
        self.store.incr_ex(&times, self.cooldown_window).await
    }

    /// Whether the fuse flag is set. Read errors count as not fused.
    pub async fn is_fused(&self, service_name: &str, hash: &str) -> bool {
        match self.store.get(&fuse_key(service_name, hash)).await {
            Ok(value) => value.is_some_and(|v| !v.is_empty()),
            Err(e) => {
                tracing::error!(service = service_name, error = %e, "Failed to read alarm fuse");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::rules::StaticRuleSource;
    use herald_common::types::FilterRule;

    const WINDOW: Duration = Duration::from_secs(60);
    const FUSE: Duration = Duration::from_secs(300);

    fn controller(store: Arc<MemoryStore>, rules: Vec<FilterRule>) -> FuseController {
        let classifier = MessageClassifier::new(
            store.clone(),
            Arc::new(StaticRuleSource::new(rules)),
            Duration::from_secs(3600),
        );
        FuseController::new(store, classifier, WINDOW, FUSE)
    }

    #[test]
    fn test_message_hash_is_stable() {
        assert_eq!(message_hash("abc"), message_hash("abc"));
        assert_ne!(message_hash("abc"), message_hash("abd"));
        assert_eq!(message_hash("abc").len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_occurrence_and_beyond_are_suppressed() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store, vec![FilterRule::new("timeout", 3)]);

        let decisions: Vec<FuseDecision> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(fuse.admit("svc", "db timeout").await);
            }
            out
        };

        assert_eq!(
            decisions,
            vec![
                FuseDecision::Enqueue,
                FuseDecision::Enqueue,
                FuseDecision::Suppress,
                FuseDecision::Suppress,
                FuseDecision::Suppress,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fuse_expires() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store, vec![FilterRule::new("timeout", 2)]);

        assert_eq!(fuse.admit("svc", "timeout").await, FuseDecision::Enqueue);
        assert_eq!(fuse.admit("svc", "timeout").await, FuseDecision::Suppress);

        tokio::time::advance(FUSE + Duration::from_secs(1)).await;
        assert_eq!(fuse.admit("svc", "timeout").await, FuseDecision::Enqueue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_after_window() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store, vec![FilterRule::new("timeout", 2)]);

        assert_eq!(fuse.admit("svc", "timeout").await, FuseDecision::Enqueue);
        tokio::time::advance(WINDOW + Duration::from_secs(1)).await;
        // New window: this is the first repeat again
        assert_eq!(fuse.admit("svc", "timeout").await, FuseDecision::Enqueue);
    }

    #[tokio::test]
    async fn test_unmatched_messages_never_counted() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store.clone(), vec![FilterRule::new("timeout", 1)]);

        for _ in 0..10 {
            assert_eq!(fuse.admit("svc", "disk full").await, FuseDecision::Enqueue);
        }
        let hash = message_hash("disk full");
        assert_eq!(store.get(&times_key("svc", &hash)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_active_fuse_drops_unmatched_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store.clone(), vec![]);
        let hash = message_hash("disk full");
        store
            .set_ex(&fuse_key("svc", &hash), "1", FUSE)
            .await
            .unwrap();

        assert_eq!(fuse.admit("svc", "disk full").await, FuseDecision::Suppress);
    }

    #[tokio::test]
    async fn test_fused_message_does_not_touch_counter() {
        let store = Arc::new(MemoryStore::new());
        let fuse = controller(store.clone(), vec![FilterRule::new("timeout", 2)]);

        fuse.admit("svc", "timeout").await;
        fuse.admit("svc", "timeout").await; // fuses, counter reset to 0
        fuse.admit("svc", "timeout").await;

        let hash = message_hash("timeout");
        assert_eq!(
            store.get(&times_key("svc", &hash)).await.unwrap().as_deref(),
            Some("0")
        );
    }
}
