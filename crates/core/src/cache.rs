use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use payrail_store::KeyValueStore;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::Error;

/// Options for cache writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions<'a> {
    /// TTL in seconds. `None` uses the configured default; `Some(0)` stores
    /// without expiration.
    pub ttl_secs: Option<u64>,
    pub namespace: Option<&'a str>,
    /// Tags the entry joins for bulk invalidation.
    pub tags: &'a [&'a str],
}

/// Cache-aside layer over the shared store.
///
/// Reads and writes fail open: a store outage degrades to cache misses and
/// dropped writes, logged but never surfaced to the caller. Values are
/// serialized as JSON.
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    default_ttl_secs: u64,
    lock_ttl: Duration,
    lock_retry_attempts: u32,
    lock_retry_base_delay: Duration,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            default_ttl_secs: config.default_ttl_secs,
            lock_ttl: Duration::from_millis(config.lock_ttl_ms.max(1)),
            lock_retry_attempts: config.lock_retry_attempts.max(1),
            lock_retry_base_delay: Duration::from_millis(config.lock_retry_base_delay_ms.max(1)),
        }
    }

    /// Fetch and deserialize. Misses, expired entries, undecodable payloads,
    /// and store errors all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: Option<&str>) -> Option<T> {
        let entry_key = entry_key(namespace, key);
        match self.store.get(&entry_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key = %entry_key, "discarding undecodable cache entry: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %entry_key, "cache read failed: {e}");
                None
            }
        }
    }

    /// Serialize and store, registering the entry under each tag. Returns
    /// whether the entry itself was written.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: CacheOptions<'_>) -> bool {
        let entry_key = entry_key(opts.namespace, key);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %entry_key, "cache serialization failed: {e}");
                return false;
            }
        };

        let ttl = self.ttl_of(opts.ttl_secs);
        if let Err(e) = self.store.set(&entry_key, &raw, ttl).await {
            tracing::warn!(key = %entry_key, "cache write failed: {e}");
            return false;
        }

        for tag in opts.tags {
            // The tag set's own TTL only ever grows, so it outlives every
            // member registered under it.
            if let Err(e) = self.store.set_add(&tag_key(tag), &entry_key, ttl).await {
                tracing::warn!(tag = %tag, key = %entry_key, "tag registration failed: {e}");
            }
        }
        true
    }

    /// Cache-aside read with stampede protection.
    ///
    /// On a miss, one caller acquires a short-TTL lock, re-checks the cache,
    /// runs `fetch`, stores the result, and releases the lock; contenders
    /// back off (exponential with jitter) and re-check. The lock is
    /// cooperative: it can expire under a slow fetch, so duplicate fetches
    /// are reduced, not eliminated. After the last retry, or when the store
    /// is unreachable, the caller falls through to an uncached direct fetch
    /// so it always terminates.
    pub async fn get_or_set_with_lock<T, F, Fut>(
        &self,
        key: &str,
        opts: CacheOptions<'_>,
        fetch: F,
    ) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let entry_key = entry_key(opts.namespace, key);
        let lock_key = lock_key(&entry_key);
        let token = Uuid::new_v4().to_string();

        let mut acquired = false;
        for attempt in 0..self.lock_retry_attempts {
            if let Some(hit) = self.get::<T>(key, opts.namespace).await {
                return Ok(hit);
            }
            match self.store.try_acquire(&lock_key, &token, self.lock_ttl).await {
                Ok(true) => {
                    acquired = true;
                    break;
                }
                Ok(false) => {
                    if attempt + 1 < self.lock_retry_attempts {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    } else {
                        tracing::warn!(
                            key = %entry_key,
                            attempts = self.lock_retry_attempts,
                            "stampede lock contended, falling back to direct fetch"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %entry_key, "stampede lock unavailable: {e}");
                    break;
                }
            }
        }

        if acquired {
            // A concurrent holder may have populated the key between our miss
            // and the acquisition.
            if let Some(hit) = self.get::<T>(key, opts.namespace).await {
                self.release(&lock_key).await;
                return Ok(hit);
            }
            let result = fetch().await;
            if let Ok(ref value) = result {
                self.set(key, value, opts).await;
            }
            self.release(&lock_key).await;
            result
        } else {
            fetch().await
        }
    }

    /// Run `update` against the source of truth, then overwrite the cache
    /// with its result so readers never see the stale entry a plain
    /// cache-aside write would leave behind.
    pub async fn write_through<T, F, Fut>(
        &self,
        key: &str,
        opts: CacheOptions<'_>,
        update: F,
    ) -> Result<T, Error>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let value = update().await?;
        self.set(key, &value, opts).await;
        Ok(value)
    }

    /// Delete every entry whose key matches `pattern` within `namespace`.
    /// Returns how many were removed; store errors remove nothing.
    pub async fn invalidate(&self, pattern: &str, namespace: Option<&str>) -> u64 {
        let full = entry_key(namespace, pattern);
        match self.store.delete_matching(&full).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(pattern = %full, "cache invalidation failed: {e}");
                0
            }
        }
    }

    /// Delete every entry registered under `tag`, then the tag set itself.
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let tag_key = tag_key(tag);
        let mut keys = match self.store.set_members(&tag_key).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(tag = %tag, "tag lookup failed: {e}");
                return 0;
            }
        };
        keys.push(tag_key.clone());
        match self.store.delete(&keys).await {
            Ok(removed) => removed.saturating_sub(1),
            Err(e) => {
                tracing::warn!(tag = %tag, "tag invalidation failed: {e}");
                0
            }
        }
    }

    fn ttl_of(&self, ttl_secs: Option<u64>) -> Option<Duration> {
        match ttl_secs.unwrap_or(self.default_ttl_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.lock_retry_base_delay * 2u32.saturating_pow(attempt.min(4));
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }

    async fn release(&self, lock_key: &str) {
        if let Err(e) = self.store.release(lock_key).await {
            tracing::debug!(key = %lock_key, "stampede lock release failed: {e}");
        }
    }
}

fn entry_key(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) => format!("cache:{ns}:{key}"),
        None => format!("cache:{key}"),
    }
}

fn tag_key(tag: &str) -> String {
    format!("cache:tag:{tag}")
}

fn lock_key(entry_key: &str) -> String {
    format!("lock:{entry_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use payrail_store::{MemoryStore, StoreError};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        currency: String,
        amount_minor: i64,
    }

    fn manager() -> CacheManager {
        CacheManager::new(Arc::new(MemoryStore::new()), &CacheConfig::default())
    }

    fn quote() -> Quote {
        Quote {
            currency: "EUR".into(),
            amount_minor: 12_500,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let cache = manager();

        assert!(cache.set("quote:1", &quote(), CacheOptions::default()).await);
        let got: Quote = cache.get("quote:1", None).await.unwrap();
        assert_eq!(got, quote());

        let missing: Option<Quote> = cache.get("quote:2", None).await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let cache = manager();
        let opts = CacheOptions {
            namespace: Some("payments"),
            ..CacheOptions::default()
        };

        cache.set("k", &quote(), opts).await;
        assert!(cache.get::<Quote>("k", Some("payments")).await.is_some());
        assert!(cache.get::<Quote>("k", None).await.is_none());
        assert!(cache.get::<Quote>("k", Some("refunds")).await.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expires_entry() {
        let cache = manager();
        let opts = CacheOptions {
            ttl_secs: Some(1),
            ..CacheOptions::default()
        };

        cache.set("k", &quote(), opts).await;
        assert!(cache.get::<Quote>("k", None).await.is_some());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get::<Quote>("k", None).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiration() {
        let cache = manager();
        let opts = CacheOptions {
            ttl_secs: Some(0),
            ..CacheOptions::default()
        };
        cache.set("k", &quote(), opts).await;
        assert!(cache.get::<Quote>("k", None).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = manager();
        let opts = CacheOptions {
            namespace: Some("payments"),
            ..CacheOptions::default()
        };

        cache.set("acct-1:recent", &quote(), opts).await;
        cache.set("acct-1:totals", &quote(), opts).await;
        cache.set("acct-2:recent", &quote(), opts).await;

        let removed = cache.invalidate("acct-1:*", Some("payments")).await;
        assert_eq!(removed, 2);
        assert!(cache.get::<Quote>("acct-1:recent", Some("payments")).await.is_none());
        assert!(cache.get::<Quote>("acct-2:recent", Some("payments")).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheManager::new(store.clone(), &CacheConfig::default());
        let tagged = CacheOptions {
            tags: &["tenant:acct-1"],
            ..CacheOptions::default()
        };

        cache.set("a", &quote(), tagged).await;
        cache.set("b", &quote(), tagged).await;
        cache.set("c", &quote(), CacheOptions::default()).await;

        let removed = cache.invalidate_by_tag("tenant:acct-1").await;
        assert_eq!(removed, 2);
        assert!(cache.get::<Quote>("a", None).await.is_none());
        assert!(cache.get::<Quote>("b", None).await.is_none());
        assert!(cache.get::<Quote>("c", None).await.is_some());

        // The tag set itself is gone too.
        assert!(store.set_members("cache:tag:tenant:acct-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_set_populates_once() {
        let cache = manager();
        let calls = AtomicUsize::new(0);

        let first: Quote = cache
            .get_or_set_with_lock("k", CacheOptions::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(quote())
            })
            .await
            .unwrap();
        assert_eq!(first, quote());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second: Quote = cache
            .get_or_set_with_lock("k", CacheOptions::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(quote())
            })
            .await
            .unwrap();
        assert_eq!(second, quote());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(manager());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set_with_lock("k", CacheOptions::default(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(quote())
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), quote());
        }

        let fetches = calls.load(Ordering::SeqCst);
        assert!(fetches >= 1);
        // The lock bounds duplicate recomputation well below one per caller.
        assert!(fetches < 8, "expected bounded fetches, got {fetches}");
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_and_releases_lock() {
        let cache = manager();

        let result: Result<Quote, Error> = cache
            .get_or_set_with_lock("k", CacheOptions::default(), || async {
                Err(Error::Database("source of truth down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Database(_))));

        // The lock was released, so a follow-up fetch proceeds immediately.
        let recovered: Quote = cache
            .get_or_set_with_lock("k", CacheOptions::default(), || async { Ok(quote()) })
            .await
            .unwrap();
        assert_eq!(recovered, quote());
    }

    #[tokio::test]
    async fn test_write_through_overwrites() {
        let cache = manager();
        cache.set("k", &quote(), CacheOptions::default()).await;

        let updated = Quote {
            currency: "EUR".into(),
            amount_minor: 99_000,
        };
        let written: Quote = cache
            .write_through("k", CacheOptions::default(), || {
                let updated = updated.clone();
                async move { Ok(updated) }
            })
            .await
            .unwrap();

        assert_eq!(written.amount_minor, 99_000);
        let read: Quote = cache.get("k", None).await.unwrap();
        assert_eq!(read, written);
    }

    struct FailingStore;

    #[async_trait]
    impl KeyValueStore for FailingStore {
        async fn window_record(
            &self,
            _: &str,
            _: i64,
            _: i64,
            _: &str,
            _: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn window_count(&self, _: &str, _: i64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &[String]) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete_matching(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_add(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn release(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let cache = CacheManager::new(Arc::new(FailingStore), &CacheConfig::default());

        let missing: Option<Quote> = cache.get("k", None).await;
        assert!(missing.is_none());
        assert!(!cache.set("k", &quote(), CacheOptions::default()).await);
        assert_eq!(cache.invalidate("*", None).await, 0);
        assert_eq!(cache.invalidate_by_tag("t").await, 0);

        // Lock unavailable degrades to a direct, uncached fetch.
        let fetched: Quote = cache
            .get_or_set_with_lock("k", CacheOptions::default(), || async { Ok(quote()) })
            .await
            .unwrap();
        assert_eq!(fetched, quote());
    }
}
