//! Counter store abstraction and backends.
//!
//! The rate limiter only needs a narrow capability from its backing store:
//! keyed reads, writes with a time-to-live, and deletion. Anything that can
//! expire keys on its own satisfies the contract.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors raised by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-key expiration.
///
/// Implementations must report a key as absent once its TTL has elapsed.
/// A missing key is `Ok(None)`, never an error.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Create or overwrite `key`, replacing both its value and its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key` if present.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key.
    async fn clear_all(&self) -> Result<(), StoreError>;
}
