//! Redis-backed queue store.
//!
//! Pending keys live in a sorted set (priority mode, lowest score first) or a
//! plain set (random mode); payloads live in a hash keyed by item key:
//!
//! - `{keys_key}`: `ZSET` or `SET` of item keys
//! - `{values_key}`: `HASH` of item key → payload
//!
//! Fetching maps to `ZRANGE` / `SRANDMEMBER` followed by one `HMGET`.
//! Removal deletes the key from the set and the payload from the hash in one
//! pipeline.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{FetchOrder, QueueKeys, QueueStore, StoreError, StoreStats, WorkItem};

/// Redis implementation of [`QueueStore`].
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Names of the key set and payload hash.
    keys: QueueKeys,
}

impl RedisStore {
    /// Connects to Redis and creates a store over `keys`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `keys` - Names of the key set and payload hash
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: QueueKeys) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis, keys })
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn from_connection(redis: ConnectionManager, keys: QueueKeys) -> Self {
        Self { redis, keys }
    }

    /// Returns the queue keys.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Adds an item to the queue.
    ///
    /// With `FetchOrder::Priority` the key is added to the sorted set with
    /// `score`; otherwise it is added to the plain set and `score` is ignored.
    pub async fn push(
        &self,
        order: FetchOrder,
        item: &WorkItem,
        score: f64,
    ) -> Result<(), StoreError> {
        self.push_batch(order, std::slice::from_ref(item), |_| score)
            .await
    }

    /// Adds many items in a single pipeline.
    ///
    /// `score` computes the sorted-set score of the item at a given index.
    pub async fn push_batch<F>(
        &self,
        order: FetchOrder,
        items: &[WorkItem],
        score: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(usize) -> f64,
    {
        if items.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for (index, item) in items.iter().enumerate() {
            match order {
                FetchOrder::Priority => {
                    pipe.zadd(self.keys.keys_key(), &item.key, score(index))
                        .ignore();
                }
                FetchOrder::Random => {
                    pipe.sadd(self.keys.keys_key(), &item.key).ignore();
                }
            }
            pipe.hset(self.keys.values_key(), &item.key, &item.payload)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(count = items.len(), keys_key = %self.keys.keys_key(), "Pushed items");
        Ok(())
    }

    /// Returns store statistics for the given fetch order.
    pub async fn stats(&self, order: FetchOrder) -> Result<StoreStats, StoreError> {
        let mut conn = self.redis.clone();

        let pending_keys: usize = match order {
            FetchOrder::Priority => conn.zcard(self.keys.keys_key()).await?,
            FetchOrder::Random => conn.scard(self.keys.keys_key()).await?,
        };
        let payloads: usize = conn.hlen(self.keys.values_key()).await?;

        Ok(StoreStats {
            pending_keys,
            payloads,
        })
    }

    /// Deletes both the key set and the payload hash.
    ///
    /// **Warning**: This permanently deletes all pending items.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(self.keys.keys_key())
            .ignore()
            .del(self.keys.values_key())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn fetch_keys(&self, order: FetchOrder, limit: usize) -> Result<Vec<String>, StoreError> {
        // ZRANGE 0 -1 would return the whole set
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let keys: Vec<String> = match order {
            FetchOrder::Priority => {
                let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
                conn.zrange(self.keys.keys_key(), 0, stop).await?
            }
            FetchOrder::Random => {
                conn.srandmember_multiple(self.keys.keys_key(), limit)
                    .await?
            }
        };

        Ok(keys)
    }

    async fn fetch_payloads(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.values_key())
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        Ok(values)
    }

    async fn remove(&self, order: FetchOrder, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        match order {
            FetchOrder::Priority => pipe.zrem(self.keys.keys_key(), key).ignore(),
            FetchOrder::Random => pipe.srem(self.keys.keys_key(), key).ignore(),
        };
        pipe.hdel(self.keys.values_key(), key).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}
