use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use payrail_core::context::{self, RequestContext};
use uuid::Uuid;

/// First-touched middleware: builds the baseline request context and binds it
/// around the remainder of request processing.
///
/// An inbound `x-correlation-id` is honored so callers can thread one logical
/// operation across services; a fresh request id is always generated. Both
/// ids are echoed as response headers for client-side tracing.
pub async fn correlation_middleware(request: Request, next: Next) -> Response {
    let headers = request.headers();

    let correlation_id = headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Prefer forwarded headers, fall back to the socket address.
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        });

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let ctx = RequestContext::new(correlation_id.clone(), client_ip.clone(), user_agent);
    let request_id = ctx.request_id.clone();
    let started_at = ctx.started_at;

    tracing::info!(
        request_id = %request_id,
        correlation_id = %correlation_id,
        client_ip = %client_ip.as_deref().unwrap_or("-"),
        method = %method,
        path = %path,
        "request received"
    );

    let mut response = context::scope(ctx, next.run(request)).await;

    tracing::info!(
        request_id = %request_id,
        status = response.status().as_u16(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    let headers = response.headers_mut();
    if let Ok(v) = correlation_id.parse() {
        headers.insert("x-correlation-id", v);
    }
    if let Ok(v) = request_id.parse() {
        headers.insert("x-request-id", v);
    }

    response
}
