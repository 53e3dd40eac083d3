//! In-process queue store.
//!
//! Mirrors the Redis layout (scored key set + payload map) behind a mutex.
//! Priority fetches return the lowest scores first with ties broken by key,
//! which is the order `ZRANGE` uses. Random fetches shuffle the key set.
//!
//! Connectivity and fetch failures can be toggled, and every store access is
//! counted, so the director can be exercised without a Redis server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{FetchOrder, QueueStore, StoreError, StoreStats, WorkItem};

#[derive(Debug, Default)]
struct MemoryState {
    /// Pending key → score.
    members: BTreeMap<String, f64>,
    /// Key → payload.
    values: HashMap<String, String>,
}

/// In-memory implementation of [`QueueStore`].
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
    fail_fetches: AtomicBool,
    key_fetches: AtomicUsize,
    payload_fetches: AtomicUsize,
    removals: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty, connected store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            connected: AtomicBool::new(true),
            fail_fetches: AtomicBool::new(false),
            key_fetches: AtomicUsize::new(0),
            payload_fetches: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds an item with the given priority score.
    pub fn push(&self, item: WorkItem, score: f64) {
        let mut state = self.state();
        state.members.insert(item.key.clone(), score);
        state.values.insert(item.key, item.payload);
    }

    /// Adds items, scoring each by its position.
    pub fn extend(&self, items: impl IntoIterator<Item = WorkItem>) {
        for (index, item) in items.into_iter().enumerate() {
            self.push(item, index as f64);
        }
    }

    /// Adds a pending key without a payload.
    pub fn push_key_only(&self, key: impl Into<String>, score: f64) {
        self.state().members.insert(key.into(), score);
    }

    /// Whether `key` is still pending.
    pub fn contains(&self, key: &str) -> bool {
        self.state().members.contains_key(key)
    }

    /// Returns the payload stored under `key`.
    pub fn payload(&self, key: &str) -> Option<String> {
        self.state().values.get(key).cloned()
    }

    /// Returns the pending keys in key order.
    pub fn pending_keys(&self) -> Vec<String> {
        self.state().members.keys().cloned().collect()
    }

    /// Returns current store statistics.
    pub fn stats(&self) -> StoreStats {
        let state = self.state();
        StoreStats {
            pending_keys: state.members.len(),
            payloads: state.values.len(),
        }
    }

    /// Marks the connection as live or dead.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every subsequent key fetch fail until reset.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Number of `fetch_keys` calls served.
    pub fn key_fetches(&self) -> usize {
        self.key_fetches.load(Ordering::SeqCst)
    }

    /// Number of `fetch_payloads` calls served.
    pub fn payload_fetches(&self) -> usize {
        self.payload_fetches.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls served.
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Total number of store accesses (fetches and removals).
    pub fn accesses(&self) -> usize {
        self.key_fetches() + self.payload_fetches() + self.removals()
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fetch_keys(&self, order: FetchOrder, limit: usize) -> Result<Vec<String>, StoreError> {
        self.key_fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected fetch failure".to_string()));
        }

        let state = self.state();
        let mut keys: Vec<String> = match order {
            FetchOrder::Priority => {
                let mut scored: Vec<(&String, f64)> =
                    state.members.iter().map(|(k, s)| (k, *s)).collect();
                scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                scored.into_iter().map(|(k, _)| k.clone()).collect()
            }
            FetchOrder::Random => {
                let mut keys: Vec<String> = state.members.keys().cloned().collect();
                keys.shuffle(&mut rand::rng());
                keys
            }
        };
        keys.truncate(limit);

        Ok(keys)
    }

    async fn fetch_payloads(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.payload_fetches.fetch_add(1, Ordering::SeqCst);

        let state = self.state();
        Ok(keys.iter().map(|k| state.values.get(k).cloned()).collect())
    }

    async fn remove(&self, _order: FetchOrder, key: &str) -> Result<(), StoreError> {
        self.removals.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        state.members.remove(key);
        state.values.remove(key);
        Ok(())
    }
}
