//! Redis-backed counter store.
//!
//! Lets several gateway processes share one set of counters. Each counter
//! is a plain string key whose expiration is managed by Redis (`SET .. PX`),
//! so idle callers vanish without any sweeping on our side.
//!
//! Decisions are serialized per key only inside one process. Two processes
//! deciding for the same caller at the same instant can both read the same
//! count; deployments that need an exact bound across replicas should route
//! a caller to a single replica.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tracing::{debug, info};

use super::{CounterStore, StoreError};

/// Configuration for the Redis store.
#[derive(Debug, Clone, Default)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key (default: none)
    pub key_prefix: String,
}

/// Counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl RedisStore {
    /// Connect to Redis and verify the server answers `PING`.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379/")
    /// * `config` - Store configuration
    pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let mut connection = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!(url = %url, prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self { connection, config })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        // PX rejects zero, so round sub-millisecond TTLs up.
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();

        if self.config.key_prefix.is_empty() {
            let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
            return Ok(());
        }

        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                let _: () = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %self.config.key_prefix, removed, "Cleared prefixed counters");
        Ok(())
    }
}
