//! Application struct that encapsulates server assembly and serving logic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use payrail_core::cache::CacheManager;
use payrail_core::config::Config;
use payrail_core::rate_limit::RateLimiter;
use payrail_core::rls::RlsSessionBinder;
use payrail_core::tenant::{PgTenantDirectory, TenantResolver};
use payrail_store::{KeyValueStore, MemoryStore, RedisStore};
use sqlx::postgres::PgPoolOptions;

use crate::cli::RunArgs;

pub struct Application {
    config: Arc<ArcSwap<Config>>,
    app_router: axum::Router,
}

impl Application {
    /// Build the application from CLI args: load config, connect the store
    /// and database, and assemble the middleware stack.
    pub async fn build(args: &RunArgs) -> anyhow::Result<Self> {
        // Load config
        let mut config = Config::load(&args.config).unwrap_or_else(|e| {
            tracing::warn!(
                "Failed to load config from '{}': {e}, using defaults",
                args.config
            );
            Config::default()
        });

        // CLI overrides
        if let Some(ref host) = args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }

        // Shared store. Redis being down at boot must not keep the API from
        // serving: the traffic-control layers fail open per process instead.
        let store: Arc<dyn KeyValueStore> =
            match RedisStore::connect(&config.redis.url, config.redis.key_prefix.clone()).await {
                Ok(store) => {
                    tracing::info!("Connected to redis at {}", config.redis.url);
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::warn!(
                        "Redis unavailable ({e}), falling back to the in-process store; \
                         rate limits and cache are per-instance until restart"
                    );
                    Arc::new(MemoryStore::new())
                }
            };

        // Database pool; connections are established lazily on first use.
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect_lazy(&config.database.url)?;

        let directory = Arc::new(PgTenantDirectory::new(pool.clone()));
        let resolver = Arc::new(TenantResolver::new(
            directory,
            config.auth.usage_queue_capacity,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), &config.rate_limit));
        let cache = Arc::new(CacheManager::new(store, &config.cache));
        let rls = Arc::new(RlsSessionBinder::new(pool));

        let config = Arc::new(ArcSwap::from_pointee(config));
        let state = payrail_server::AppState {
            config: config.clone(),
            cache,
            rate_limiter,
            resolver,
            rls,
            start_time: Instant::now(),
        };
        let app_router = payrail_server::build_router(state);

        Ok(Self { config, app_router })
    }

    /// Bind, serve HTTP, and drain gracefully on SIGINT/SIGTERM.
    pub async fn serve(self) -> anyhow::Result<()> {
        let cfg = self.config.load();
        let addr = format!("{}:{}", cfg.host, cfg.port);

        tracing::info!("Starting HTTP server on {addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        axum::serve(
            listener,
            self.app_router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("Server shut down.");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
