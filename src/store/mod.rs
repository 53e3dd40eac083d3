//! Queue store adapters.
//!
//! The director never talks to a backend directly. It consumes the
//! [`QueueStore`] capability:
//!
//! - **fetch_keys**: bounded candidate key fetch, either priority-ordered
//!   (ordered set, ascending score) or a random sample (unordered set)
//! - **fetch_payloads**: batched key → payload lookup
//! - **remove**: delete a delivered key and its payload
//!
//! # Layout
//!
//! Both shipped adapters use the same two-structure layout:
//!
//! - `{keys_key}`: sorted set (priority mode) or set (random mode) of item keys
//! - `{keys_key}_values`: hash mapping item key → payload
//!
//! [`RedisStore`] implements it on Redis, [`InMemoryStore`] in process.

pub mod item;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use thiserror::Error;

pub use item::WorkItem;
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

/// Suffix appended to the keys key to derive the default payload hash key.
pub const VALUES_KEY_SUFFIX: &str = "_values";

/// Default key of the set holding pending item keys.
pub const DEFAULT_KEYS_KEY: &str = "writer_keys";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No live connection to the backing store.
    #[error("Store is not connected")]
    NotConnected,

    /// Failed to connect to the backing store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A store key name was rejected.
    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    /// Backend-specific failure.
    #[error("Store operation failed: {0}")]
    Backend(String),
}

/// How candidate keys are selected from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrder {
    /// Lowest-scored members of an ordered set first.
    Priority,
    /// Random distinct members of an unordered set.
    Random,
}

impl FetchOrder {
    /// Selects the order matching the `prioritized_queue` setting.
    pub fn from_prioritized(prioritized: bool) -> Self {
        if prioritized {
            Self::Priority
        } else {
            Self::Random
        }
    }
}

/// Names of the two store structures backing a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    keys_key: String,
    values_key: String,
}

impl QueueKeys {
    /// Creates queue keys, deriving the payload hash key as
    /// `{keys_key}_values`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidKey` if `keys_key` is empty.
    pub fn new(keys_key: impl Into<String>) -> Result<Self, StoreError> {
        let keys_key = keys_key.into();
        let values_key = format!("{}{}", keys_key, VALUES_KEY_SUFFIX);
        Self::with_values_key(keys_key, values_key)
    }

    /// Creates queue keys with an explicit payload hash key.
    pub fn with_values_key(
        keys_key: impl Into<String>,
        values_key: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let keys_key = keys_key.into();
        let values_key = values_key.into();

        if keys_key.trim().is_empty() {
            return Err(StoreError::InvalidKey("keys key is required".to_string()));
        }
        if values_key.trim().is_empty() {
            return Err(StoreError::InvalidKey(
                "values key cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            keys_key,
            values_key,
        })
    }

    /// Key of the set holding pending item keys.
    pub fn keys_key(&self) -> &str {
        &self.keys_key
    }

    /// Key of the hash holding payloads.
    pub fn values_key(&self) -> &str {
        &self.values_key
    }
}

/// Capability consumed by the director to load and retire work items.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Whether a live connection is available.
    fn is_connected(&self) -> bool {
        true
    }

    /// Fetches up to `limit` candidate keys.
    async fn fetch_keys(&self, order: FetchOrder, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Resolves payloads for `keys`, positionally. Missing payloads are `None`.
    async fn fetch_payloads(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Removes a delivered key and its payload.
    async fn remove(&self, order: FetchOrder, key: &str) -> Result<(), StoreError>;
}

/// Statistics about store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of pending keys.
    pub pending_keys: usize,
    /// Number of stored payloads.
    pub payloads: usize,
}

impl StoreStats {
    /// Payloads without a pending key (or keys without a payload).
    pub fn orphaned(&self) -> usize {
        self.pending_keys.abs_diff(self.payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_derive_values_key() {
        let keys = QueueKeys::new("test_writer").expect("valid key");
        assert_eq!(keys.keys_key(), "test_writer");
        assert_eq!(keys.values_key(), "test_writer_values");
    }

    #[test]
    fn test_queue_keys_reject_empty() {
        let err = QueueKeys::new("").expect_err("empty key must fail");
        assert!(err.to_string().contains("required"));

        assert!(QueueKeys::with_values_key("jobs", " ").is_err());
    }

    #[test]
    fn test_fetch_order_from_prioritized() {
        assert_eq!(FetchOrder::from_prioritized(true), FetchOrder::Priority);
        assert_eq!(FetchOrder::from_prioritized(false), FetchOrder::Random);
    }

    #[test]
    fn test_store_error_display() {
        assert!(StoreError::NotConnected.to_string().contains("not connected"));

        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_store_stats_orphaned() {
        let stats = StoreStats {
            pending_keys: 10,
            payloads: 7,
        };
        assert_eq!(stats.orphaned(), 3);
    }
}
