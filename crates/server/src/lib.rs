pub mod handler;
pub mod middleware;

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::{Router, middleware as axum_mw};
use payrail_core::cache::CacheManager;
use payrail_core::config::Config;
use payrail_core::rate_limit::RateLimiter;
use payrail_core::rls::RlsSessionBinder;
use payrail_core::tenant::TenantResolver;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub cache: Arc<CacheManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub resolver: Arc<TenantResolver>,
    pub rls: Arc<RlsSessionBinder>,
    pub start_time: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit_bytes = state.config.load().body_limit_mb * 1024 * 1024;

    // Public routes: no tenant resolution, no rate limiting
    let public_routes = Router::new().route("/health", axum::routing::get(handler::health::health));

    // API routes: tenant resolution, then rate limiting, then body limit
    let api_routes = Router::new()
        .route(
            "/v1/payments",
            axum::routing::get(handler::payments::list_payments)
                .post(handler::payments::create_payment),
        )
        .route(
            "/v1/payments/{id}",
            axum::routing::get(handler::payments::get_payment),
        )
        .route(
            "/v1/payments/{id}/cancel",
            axum::routing::post(handler::payments::cancel_payment),
        )
        .route(
            "/v1/rate-limit",
            axum::routing::get(handler::rate_limit::rate_limit_status),
        )
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::tenant::tenant_middleware,
        ));

    // Compose: correlation binds the request context before anything below
    // it runs, for public and API routes alike.
    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(axum_mw::from_fn(
            middleware::correlation::correlation_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
