use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peercall::{
    api::{create_router, AppState, RateLimiter},
    config::Config,
    db::{self, SessionRepository},
    error::AppError,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,peercall=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting peercall signaling server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);
    tracing::info!("Configuration loaded");

    let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(connect_options)
        .await?;

    tracing::info!("Database connected: {}", config.database_url);

    db::migrate(&pool).await?;
    tracing::info!("Database migrations completed");

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute, 60));
    tracing::info!("Rate limiter configured ({} req/min per client)", config.rate_limit_per_minute);

    let state = AppState::new(pool.clone(), config.clone());

    // Expired session cleanup
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match SessionRepository::cleanup_expired(&pool).await {
                    Ok(removed) => tracing::debug!(removed, "expired sessions cleaned up"),
                    Err(e) => tracing::error!("Session cleanup failed: {}", e),
                }
            }
        });
    }

    // Consumed signal purge
    {
        let service = state.service.clone();
        let period = config.signal_retention().min(Duration::from_secs(600));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match service.purge_consumed().await {
                    Ok(purged) => tracing::debug!(purged, "consumed signals purged"),
                    Err(e) => tracing::error!("Signal purge failed: {}", e),
                }
            }
        });
    }

    // Rate limiter cleanup
    {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let evicted = limiter.cleanup().await;
                tracing::debug!(evicted, "rate limiter cache cleaned up");
            }
        });
    }
    tracing::info!("Maintenance tasks started");

    let app = create_router(state, rate_limiter);

    let addr = config.server_address();
    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Health check: http://{}/api/health", addr);
    tracing::info!("API Endpoints:");
    tracing::info!("  GET  /api/users          - Presence list (requires auth)");
    tracing::info!("  POST /api/status         - Set own status (requires auth)");
    tracing::info!("  POST /api/calls          - Send call invitation (requires auth)");
    tracing::info!("  POST /api/signals        - Send signal (requires auth)");
    tracing::info!("  GET  /api/signals        - Fetch own signals (requires auth)");
    tracing::info!("  POST /api/signals/delete - Delete own signals (requires auth)");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
