//! Beacon API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use beacon_common::clock::{Clock, SystemClock};
use beacon_common::config::{AppConfig, BreakerBackend};
use beacon_common::db::{create_pool, run_migrations};
use beacon_common::redis_pool::create_redis_pool;
use beacon_engine::store::PgStore;
use beacon_notifier::breaker::{BreakerSettings, CircuitBreaker, InMemoryBreaker, RedisBreaker};
use beacon_notifier::directory::PgRecipientDirectory;
use beacon_notifier::dispatcher::DispatchSettings;

use beacon_api::routes::create_router;
use beacon_api::state::{AppState, Components, providers_from_config};

/// Request bodies above this size are rejected.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "beacon_api=debug,beacon_engine=debug,beacon_notifier=debug,tower_http=debug",
            )
        }))
        .init();

    tracing::info!("Starting Beacon API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let breaker_settings = BreakerSettings::from_config(&config);
    let breaker: Arc<dyn CircuitBreaker> = match config.breaker_backend {
        BreakerBackend::Memory => Arc::new(InMemoryBreaker::new(breaker_settings, clock.clone())),
        BreakerBackend::Redis => {
            let redis = create_redis_pool(&config.redis_url).await?;
            Arc::new(RedisBreaker::new(redis, breaker_settings, clock.clone()))
        }
    };
    tracing::info!(backend = ?config.breaker_backend, "Circuit breaker ready");

    let store = Arc::new(PgStore::new(pool.clone()));
    let state = AppState::new(Components {
        notifications: store.clone(),
        attempts: store,
        providers: providers_from_config(&config)?,
        breaker,
        directory: Arc::new(PgRecipientDirectory::new(pool)),
        clock,
        dispatch: DispatchSettings::from_config(&config),
    });

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.api_bind_addr.parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
