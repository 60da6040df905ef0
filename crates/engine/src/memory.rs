//! In-process [`AlarmStore`] for tests and single-node runs without Redis.
//!
//! Expiry and the store clock both follow `tokio::time`, so tests running
//! with a paused clock see TTLs and delayed-queue due times advance with it.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use herald_common::error::AppError;

use crate::store::AlarmStore;

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
}

impl Inner {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&mut (String, Option<Instant>)> {
        let expired = matches!(self.values.get(key), Some((_, Some(deadline))) if *deadline <= now);
        if expired {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

/// Memory-backed store with the same semantics as the Redis store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    epoch_millis: i64,
    started: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        let epoch_millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            epoch_millis,
            started: Instant::now(),
        }
    }

    /// Number of entries in a list.
    pub fn list_len(&self, list: &str) -> usize {
        self.inner.lock().lists.get(list).map_or(0, VecDeque::len)
    }

    /// Number of members in a sorted set.
    pub fn zset_len(&self, zset: &str) -> usize {
        self.inner.lock().zsets.get(zset).map_or(0, HashMap::len)
    }

    /// Members of a sorted set with their scores, lowest first.
    pub fn zset_entries(&self, zset: &str) -> Vec<(String, i64)> {
        let inner = self.inner.lock();
        let mut entries: Vec<(String, i64)> = inner
            .zsets
            .get(zset)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        self.inner.lock().lists.get_mut(list).and_then(VecDeque::pop_back)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_value(key, Instant::now()).map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let deadline = Instant::now() + ttl;
        self.inner
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.live_value(key, now).is_some() {
            return Ok(false);
        }
        inner
            .values
            .insert(key.to_string(), (value.to_string(), Some(now + ttl)));
        Ok(true)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, AppError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.live_value(key, now) {
            Some((value, _)) => {
                let count = value
                    .parse::<i64>()
                    .map_err(|_| AppError::Internal(format!("Value at '{}' is not an integer", key)))?
                    + 1;
                *value = count.to_string();
                Ok(count)
            }
            None => {
                inner
                    .values
                    .insert(key.to_string(), ("1".to_string(), Some(now + ttl)));
                Ok(1)
            }
        }
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<(), AppError> {
        self.inner
            .lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed
            let mut notified = pin!(self.pushed.notified());
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd(&self, zset: &str, score: i64, member: &str) -> Result<(), AppError> {
        self.inner
            .lock()
            .zsets
            .entry(zset.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, AppError> {
        let mut due: Vec<(String, i64)> = self
            .zset_entries(zset)
            .into_iter()
            .filter(|(_, score)| *score <= max_score)
            .collect();
        due.truncate(limit);
        Ok(due.into_iter().map(|(member, _)| member).collect())
    }

    async fn move_to_list(
        &self,
        zset: &str,
        list: &str,
        moves: &[(String, String)],
        discard: &[String],
    ) -> Result<(), AppError> {
        {
            let mut inner = self.inner.lock();
            for (member, payload) in moves {
                inner
                    .lists
                    .entry(list.to_string())
                    .or_default()
                    .push_front(payload.clone());
                if let Some(set) = inner.zsets.get_mut(zset) {
                    set.remove(member);
                }
            }
            if let Some(set) = inner.zsets.get_mut(zset) {
                for member in discard {
                    set.remove(member);
                }
            }
        }
        if !moves.is_empty() {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn now_millis(&self) -> Result<i64, AppError> {
        Ok(self.epoch_millis + self.started.elapsed().as_millis() as i64)
    }
}
