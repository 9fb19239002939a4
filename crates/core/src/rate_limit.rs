use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use payrail_store::{KeyValueStore, StoreError};
use uuid::Uuid;

use crate::config::{RateLimitConfig, RateLimitQuota};
use crate::tenant::KeyMode;

/// Count above this fraction of the limit logs a capacity warning.
const NEAR_LIMIT_RATIO: f64 = 0.8;
/// Window keys expire this long after the window itself so an idle
/// identifier cleans itself up.
const WINDOW_TTL_BUFFER_SECS: u64 = 60;

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Wall-clock ms at which the current window boundary passes.
    pub reset_ms: i64,
    /// Seconds the caller should wait before retrying; 0 when allowed.
    pub retry_after_secs: u64,
    /// True when the store was unreachable and the check failed open.
    pub fallback: bool,
}

/// Sliding-window rate limiter over the shared store.
///
/// Each check is one atomic store round trip (prune, record, refresh TTL,
/// count), so the count stays correct when many server instances share the
/// same Redis. Store failures never block traffic: the check fails open with
/// `fallback = true` and full quota reported.
///
/// Window boundaries trust the local wall clock; skew between hosts can
/// under- or over-count near window edges.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: ArcSwap<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            config: ArcSwap::from_pointee(config.clone()),
        }
    }

    /// Swap in new quotas (called on config reload).
    pub fn update_config(&self, config: &RateLimitConfig) {
        self.config.store(Arc::new(config.clone()));
    }

    pub fn enabled(&self) -> bool {
        self.config.load().enabled
    }

    /// Default quota for a traffic class: live keys, test keys, or
    /// unauthenticated (per-IP) traffic.
    pub fn quota_for(&self, mode: Option<KeyMode>) -> RateLimitQuota {
        let config = self.config.load();
        match mode {
            Some(KeyMode::Live) => config.live,
            Some(KeyMode::Test) => config.test,
            None => config.anonymous,
        }
    }

    /// Count this request against `id` and decide whether it may proceed.
    pub async fn check(&self, id: &str, quota: RateLimitQuota) -> RateLimitDecision {
        if !self.enabled() {
            return RateLimitDecision {
                allowed: true,
                limit: quota.requests,
                remaining: quota.requests,
                reset_ms: 0,
                retry_after_secs: 0,
                fallback: false,
            };
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = quota.window_secs as i64 * 1000;
        let cutoff_ms = now_ms - window_ms;
        // Unique member so concurrent requests on the same millisecond are
        // counted separately.
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let ttl = Duration::from_secs(quota.window_secs + WINDOW_TTL_BUFFER_SECS);

        match self
            .store
            .window_record(&window_key(id), cutoff_ms, now_ms, &member, ttl)
            .await
        {
            Ok(count) => self.decide(id, quota, now_ms, count),
            Err(e) => fail_open(id, quota, now_ms, window_ms, &e),
        }
    }

    /// Current standing for `id` without consuming quota: prune and count
    /// only. `allowed` reports whether a request made now would pass.
    pub async fn status(&self, id: &str, quota: RateLimitQuota) -> RateLimitDecision {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = quota.window_secs as i64 * 1000;
        let cutoff_ms = now_ms - window_ms;

        match self.store.window_count(&window_key(id), cutoff_ms).await {
            Ok(count) => {
                let allowed = count < quota.requests as u64;
                let remaining = (quota.requests as u64).saturating_sub(count) as u32;
                let reset_ms = now_ms.div_ceil(window_ms) * window_ms;
                RateLimitDecision {
                    allowed,
                    limit: quota.requests,
                    remaining,
                    reset_ms,
                    retry_after_secs: if allowed {
                        0
                    } else {
                        ((reset_ms - now_ms) as u64).div_ceil(1000)
                    },
                    fallback: false,
                }
            }
            Err(e) => fail_open(id, quota, now_ms, window_ms, &e),
        }
    }

    fn decide(
        &self,
        id: &str,
        quota: RateLimitQuota,
        now_ms: i64,
        count: u64,
    ) -> RateLimitDecision {
        let window_ms = quota.window_secs as i64 * 1000;
        let allowed = count <= quota.requests as u64;
        let remaining = (quota.requests as u64).saturating_sub(count) as u32;
        let reset_ms = now_ms.div_ceil(window_ms) * window_ms;
        let retry_after_secs = if allowed {
            0
        } else {
            ((reset_ms - now_ms) as u64).div_ceil(1000)
        };

        if allowed && count as f64 > quota.requests as f64 * NEAR_LIMIT_RATIO {
            tracing::warn!(
                identifier = %id,
                count,
                limit = quota.requests,
                "rate limit nearly exhausted"
            );
        }

        RateLimitDecision {
            allowed,
            limit: quota.requests,
            remaining,
            reset_ms,
            retry_after_secs,
            fallback: false,
        }
    }
}

fn window_key(id: &str) -> String {
    format!("ratelimit:{id}")
}

/// Availability beats strict enforcement: report the request as allowed with
/// full quota and flag the degradation.
fn fail_open(
    id: &str,
    quota: RateLimitQuota,
    now_ms: i64,
    window_ms: i64,
    e: &StoreError,
) -> RateLimitDecision {
    tracing::warn!(identifier = %id, "rate limit store unavailable, failing open: {e}");
    RateLimitDecision {
        allowed: true,
        limit: quota.requests,
        remaining: quota.requests,
        reset_ms: now_ms + window_ms,
        retry_after_secs: 0,
        fallback: true,
    }
}
