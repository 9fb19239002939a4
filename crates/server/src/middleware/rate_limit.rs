use crate::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use payrail_core::context;
use payrail_core::error::Error;

/// Enforces the sliding-window limit for the identity bound to the current
/// context: the resolved API key when present, the client IP otherwise.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if !state.rate_limiter.enabled() {
        return Ok(next.run(request).await);
    }

    let ctx = context::require()?;
    let Some(id) = ctx.rate_limit_id() else {
        // No key and no discernible client IP: nothing to key a window on.
        return Ok(next.run(request).await);
    };

    let quota = state.rate_limiter.quota_for(ctx.key_mode);
    let decision = state.rate_limiter.check(&id, quota).await;

    if !decision.allowed {
        return Err(Error::RateLimited {
            limit: decision.limit,
            remaining: 0,
            reset_ms: decision.reset_ms,
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(v) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = decision.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = decision.reset_ms.to_string().parse() {
        headers.insert("x-ratelimit-reset", v);
    }

    Ok(response)
}
