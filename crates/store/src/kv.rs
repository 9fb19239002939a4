use std::time::Duration;

use async_trait::async_trait;

/// Failure talking to the external store.
///
/// Callers at subsystem boundaries (rate limiter, cache) are expected to
/// catch these and degrade rather than propagate them to the client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Operations the traffic-control core needs from a shared key-value store.
///
/// The sliding-window and lock operations must be atomic with respect to
/// other processes sharing the same store; in-process synchronization is not
/// enough in a horizontally-scaled deployment.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically: prune window entries scored below `cutoff_ms`, record a
    /// new entry for `member` scored at `now_ms`, refresh the window's TTL,
    /// and return the resulting entry count.
    ///
    /// `member` must be unique per call so concurrent requests landing on the
    /// same millisecond are counted separately.
    async fn window_record(
        &self,
        key: &str,
        cutoff_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Prune and count a window without recording a new entry.
    async fn window_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`. `ttl = None` stores without expiration.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Delete every key matching a glob-style pattern, returning the count.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Add `member` to the set at `key`.
    ///
    /// When `ttl` is given, the set's expiration is raised to it only if that
    /// is longer than whatever currently remains (monotonic); when `ttl` is
    /// `None` the set is made persistent.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Set-if-absent with TTL. Returns true when `key` was free and is now
    /// held with `token`; the entry self-expires after `ttl` if never
    /// released.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Drop a lock entry. Releasing a lock that already expired is a no-op.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}
