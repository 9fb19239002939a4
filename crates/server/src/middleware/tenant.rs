use crate::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use payrail_core::context;
use payrail_core::error::Error;

/// Resolves an API key to a tenant and re-opens the context scope with the
/// resolved identity for the rest of the request.
///
/// Requests without a key pass through unauthenticated; whether a route
/// tolerates that is the authorization layer's call, not this one's.
pub async fn tenant_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    // Extract token from Authorization: Bearer or x-api-key header
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        })
        .map(|v| v.to_string());

    let Some(token) = token else {
        return Ok(next.run(request).await);
    };

    let identity = state.resolver.resolve(&token).await?;
    let ctx = context::require()?;

    tracing::debug!(
        request_id = %ctx.request_id,
        tenant_id = %identity.tenant_id,
        api_key_id = %identity.api_key_id,
        "tenant resolved"
    );

    let extended = ctx.with_identity(identity.tenant_id, identity.api_key_id, identity.key_mode);
    Ok(context::scope(extended, next.run(request)).await)
}
