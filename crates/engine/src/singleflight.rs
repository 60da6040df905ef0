//! Keyed in-flight request coalescing.
//!
//! Concurrent callers asking for the same key while a fetch is running wait
//! for that fetch and receive a clone of its result instead of starting
//! their own. Once the fetch completes the key is forgotten, so the next
//! caller triggers a fresh fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Deduplicates concurrent fetches by key.
pub struct SingleFlight<T> {
    in_flight: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fetch` for `key`, or join the fetch already running for it.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = cell.get_or_init(fetch).await.clone();

        // Forget the finished flight unless a newer one already replaced it
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(key);
        }

        value
    }

    /// Number of keys with a fetch in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
