pub mod middleware;
pub mod presence;
pub mod signals;
pub mod state;

pub use state::AppState;
pub use middleware::{AuthUser, RateLimiter};

use axum::{
    Router,
    routing::{get, post},
    middleware as axum_middleware,
    extract::Request,
};
use tower_http::{
    cors::CorsLayer,
    trace::TraceLayer,
    timeout::TimeoutLayer,
};
use std::sync::Arc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub fn create_router(state: AppState, rate_limiter: Arc<RateLimiter>) -> Router {
    let timeout = state.config.request_timeout();

    let protected = Router::new()
        // Presence
        .route("/api/users", get(presence::list_users))
        .route("/api/status", post(presence::update_status))
        // Mailbox
        .route("/api/calls", post(signals::send_call_request))
        .route("/api/signals", get(signals::fetch_signals).post(signals::send_signal))
        .route("/api/signals/delete", post(signals::delete_signals))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(axum_middleware::from_fn(move |req: Request, next: axum_middleware::Next| {
            let limiter = rate_limiter.clone();
            middleware::rate_limit_middleware(limiter, req, next)
        }))
        .layer(TimeoutLayer::new(timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
