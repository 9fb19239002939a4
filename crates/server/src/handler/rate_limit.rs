use crate::AppState;
use axum::Json;
use axum::extract::State;
use payrail_core::context;
use payrail_core::error::Error;

/// Current rate-limit standing for the caller, without consuming quota.
pub async fn rate_limit_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    let ctx = context::require()?;
    let Some(id) = ctx.rate_limit_id() else {
        return Err(Error::BadRequest(
            "no identity to report rate-limit standing for".into(),
        ));
    };

    let quota = state.rate_limiter.quota_for(ctx.key_mode);
    let status = state.rate_limiter.status(&id, quota).await;

    Ok(Json(serde_json::json!({
        "limit": status.limit,
        "remaining": status.remaining,
        "reset-ms": status.reset_ms,
        "fallback": status.fallback,
    })))
}
