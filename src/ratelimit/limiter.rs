//! Core rate decision engine.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use super::key::{IdentityClass, RateKey};
use crate::config::RateLimitingConfig;
use crate::error::{Result, ThrottleError};
use crate::store::CounterStore;

/// Outcome of a rate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Admit,
    /// The caller has exhausted its window
    Deny,
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Per-class ceilings and the activity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Ceiling for address-identified callers
    pub max_address_requests: u64,
    /// Ceiling for token-identified callers
    pub max_token_requests: u64,
    /// Inactivity expiry, renewed on every admitted request
    pub window: Duration,
}

impl LimitConfig {
    pub fn new(max_address_requests: u64, max_token_requests: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(ThrottleError::Config("window duration must be greater than zero".into()));
        }
        Ok(Self {
            max_address_requests,
            max_token_requests,
            window,
        })
    }

    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Self::new(
            config.max_address_requests,
            config.max_token_requests,
            Duration::from_secs(config.window_secs),
        )
    }

    /// Ceiling for the given identity class.
    pub fn limit_for(&self, class: IdentityClass) -> u64 {
        match class {
            IdentityClass::Token => self.max_token_requests,
            IdentityClass::Address => self.max_address_requests,
        }
    }
}

/// Counts requests per caller against a shared [`CounterStore`].
///
/// Every admitted request pushes the key's expiry a full window into the
/// future, so a caller only gets a fresh window after a window's worth of
/// silence. Denied requests leave the record untouched.
///
/// The read-compare-write for one key runs under a per-key async mutex, so
/// concurrent decisions for the same caller in this process never read the
/// same count. Lock entries are dropped once no decision for the key is
/// in flight.
pub struct RateLimiter<S> {
    store: Arc<S>,
    limits: LimitConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn new(store: Arc<S>, limits: LimitConfig) -> Self {
        Self {
            store,
            limits,
            locks: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &LimitConfig {
        &self.limits
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether one more request from this caller may proceed.
    pub async fn decide(&self, class: IdentityClass, identifier: &str) -> Result<Decision> {
        let key = RateKey::new(class, identifier).to_string_key();
        let limit = self.limits.limit_for(class);

        let lease = self.lease(&key);
        let _guard = lease.acquire().await;
        let decision = self.decide_locked(&key, limit).await;
        decision
    }

    /// Decide for an already resolved key.
    pub async fn decide_key(&self, key: &RateKey) -> Result<Decision> {
        self.decide(key.class, &key.identifier).await
    }

    async fn decide_locked(&self, key: &str, limit: u64) -> Result<Decision> {
        let next = match self.read_count(key).await? {
            None => 1,
            Some(count) => count.saturating_add(1),
        };

        if next > limit {
            return Ok(Decision::Deny);
        }

        self.store
            .set(key, &next.to_string(), self.limits.window)
            .await?;
        Ok(Decision::Admit)
    }

    async fn read_count(&self, key: &str) -> Result<Option<u64>> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ThrottleError::CorruptRecord {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    fn lease<'a>(&'a self, key: &'a str) -> KeyLease<'a> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyLease {
            locks: &self.locks,
            key,
            lock,
        }
    }

    /// Current count for a caller, or `None` if it has no live window.
    pub async fn current_count(&self, class: IdentityClass, identifier: &str) -> Result<Option<u64>> {
        let key = RateKey::new(class, identifier).to_string_key();
        self.read_count(&key).await
    }

    /// Forget one caller's window.
    pub async fn reset(&self, class: IdentityClass, identifier: &str) -> Result<()> {
        let key = RateKey::new(class, identifier).to_string_key();
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Forget every window.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear_all().await?;
        Ok(())
    }

    /// Number of keys with a decision in flight.
    pub fn in_flight_keys(&self) -> usize {
        self.locks.len()
    }
}

/// A claim on one key's lock entry.
///
/// Dropping the lease removes the entry once no other decision holds it,
/// whether the decision completed or its future was dropped mid-flight.
struct KeyLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl KeyLease<'_> {
    async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        // The table and this lease are the only holders.
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn limiter(max_address: u64, max_token: u64, window_secs: u64) -> RateLimiter<MemoryStore> {
        let limits = LimitConfig::new(max_address, max_token, Duration::from_secs(window_secs)).unwrap();
        RateLimiter::new(Arc::new(MemoryStore::new()), limits)
    }

    async fn run(limiter: &RateLimiter<MemoryStore>, class: IdentityClass, id: &str, n: usize) -> (usize, usize) {
        let mut admitted = 0;
        let mut denied = 0;
        for _ in 0..n {
            match limiter.decide(class, id).await.unwrap() {
                Decision::Admit => admitted += 1,
                Decision::Deny => denied += 1,
            }
        }
        (admitted, denied)
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = LimitConfig::new(10, 10, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[tokio::test]
    async fn test_first_request_creates_record() {
        let limiter = limiter(10, 100, 5);

        let decision = limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap();
        assert_eq!(decision, Decision::Admit);
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            Some(1)
        );
        assert_eq!(
            limiter.store().get("addr:10.0.0.1").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_hundred_back_to_back_requests() {
        let limiter = limiter(10, 100, 5);

        let (admitted, denied) = run(&limiter, IdentityClass::Address, "10.0.0.1", 100).await;
        assert_eq!(admitted, 10);
        assert_eq!(denied, 90);
    }

    #[tokio::test]
    async fn test_deny_does_not_mutate_count() {
        let limiter = limiter(3, 100, 5);

        run(&limiter, IdentityClass::Address, "10.0.0.1", 10).await;
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_token_uses_token_ceiling() {
        let limiter = limiter(2, 5, 5);

        // Exhaust the address ceiling for the same text first.
        run(&limiter, IdentityClass::Address, "shared", 2).await;

        let (admitted, denied) = run(&limiter, IdentityClass::Token, "shared", 8).await;
        assert_eq!(admitted, 5);
        assert_eq!(denied, 3);
    }

    #[tokio::test]
    async fn test_zero_limit_denies_everything() {
        let limiter = limiter(0, 0, 5);

        let (admitted, _) = run(&limiter, IdentityClass::Address, "10.0.0.1", 3).await;
        assert_eq!(admitted, 0);
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_pause() {
        let limiter = limiter(10, 100, 5);

        let (first, _) = run(&limiter, IdentityClass::Address, "10.0.0.1", 5).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        let (second, _) = run(&limiter, IdentityClass::Address, "10.0.0.1", 5).await;

        assert_eq!(first + second, 10);
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            Some(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_extends_window() {
        let limiter = limiter(10, 100, 5);

        for _ in 0..4 {
            assert!(limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap().is_admit());
            tokio::time::advance(Duration::from_millis(4_900)).await;
        }

        // 19.6s since the first request, but never 5s of silence.
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            Some(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_denials_do_not_extend_window() {
        let limiter = limiter(2, 100, 5);

        run(&limiter, IdentityClass::Address, "10.0.0.1", 2).await;
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let decision = limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap();
            assert_eq!(decision, Decision::Deny);
        }

        // 5s after the last admission the window lapses despite the denials.
        tokio::time::advance(Duration::from_secs(1)).await;
        let decision = limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap();
        assert_eq!(decision, Decision::Admit);
        assert_eq!(
            limiter.current_count(IdentityClass::Address, "10.0.0.1").await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_is_surfaced() {
        let limiter = limiter(10, 100, 5);
        limiter
            .store()
            .set("token:abc", "not-a-number", Duration::from_secs(5))
            .await
            .unwrap();

        let err = limiter.decide(IdentityClass::Token, "abc").await.unwrap_err();
        assert!(matches!(err, ThrottleError::CorruptRecord { .. }));

        // The bad value is left in place.
        assert_eq!(
            limiter.store().get("token:abc").await.unwrap(),
            Some("not-a-number".to_string())
        );
    }

    #[tokio::test]
    async fn test_reset_and_clear() {
        let limiter = limiter(1, 1, 5);

        run(&limiter, IdentityClass::Address, "10.0.0.1", 1).await;
        run(&limiter, IdentityClass::Token, "abc", 1).await;

        limiter.reset(IdentityClass::Address, "10.0.0.1").await.unwrap();
        assert!(limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap().is_admit());
        assert_eq!(limiter.decide(IdentityClass::Token, "abc").await.unwrap(), Decision::Deny);

        limiter.clear().await.unwrap();
        assert!(limiter.decide(IdentityClass::Token, "abc").await.unwrap().is_admit());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_same_key_respects_limit() {
        let limiter = Arc::new(limiter(25, 100, 60));

        let tasks = (0..200).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.decide(IdentityClass::Address, "10.9.9.9").await })
        });

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(Decision::is_admit)
            .count();

        assert_eq!(admitted, 25);
        assert_eq!(limiter.in_flight_keys(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        async fn clear_all(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let limits = LimitConfig::new(10, 10, Duration::from_secs(5)).unwrap();
        let limiter = RateLimiter::new(Arc::new(FailingStore), limits);

        let err = limiter.decide(IdentityClass::Address, "10.0.0.1").await.unwrap_err();
        assert!(matches!(err, ThrottleError::StoreUnavailable(_)));
        assert_eq!(limiter.in_flight_keys(), 0);
    }

    /// A store whose reads never complete.
    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        async fn clear_all(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_decisions_release_locks() {
        let limits = LimitConfig::new(10, 10, Duration::from_secs(5)).unwrap();
        let limiter = RateLimiter::new(Arc::new(StalledStore), limits);

        for i in 0..200 {
            let addr = format!("10.0.{}.{}", i / 256, i % 256);
            let outcome = tokio::time::timeout(
                Duration::from_millis(1),
                limiter.decide(IdentityClass::Address, &addr),
            )
            .await;
            assert!(outcome.is_err());
        }

        assert_eq!(limiter.in_flight_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_releases_lock() {
        let limits = LimitConfig::new(10, 10, Duration::from_secs(5)).unwrap();
        let limiter = RateLimiter::new(Arc::new(StalledStore), limits);

        // The first decision holds the key's lock; the second queues behind it.
        let holder = limiter.decide(IdentityClass::Token, "abc");
        let waiter = limiter.decide(IdentityClass::Token, "abc");
        let both = async { tokio::join!(holder, waiter) };
        assert!(tokio::time::timeout(Duration::from_millis(1), both).await.is_err());

        assert_eq!(limiter.in_flight_keys(), 0);
    }
}
