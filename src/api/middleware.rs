use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::api::state::AppState;
use crate::db::SessionRepository;
use crate::error::AppError;

/// Id of the user a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Authentication middleware - resolves the bearer token to a user id
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let has_header = request.headers().contains_key("Authorization");
    let token = bearer_token(&request).ok_or_else(|| {
        if has_header {
            AppError::Unauthorized("Invalid Authorization format".to_string())
        } else {
            AppError::Unauthorized("Missing Authorization header".to_string())
        }
    })?;

    let session = SessionRepository::get_by_token(&state.db, token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired session".to_string()))?;

    request.extensions_mut().insert(AuthUser(session.user_id));

    Ok(next.run(request).await)
}

/// Simple in-memory rate limiter
/// Tracks requests per client key (session token or IP) in fixed windows
#[derive(Clone)]
pub struct RateLimiter {
    // key -> (count, window_start)
    state: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let entry = state.entry(key.to_string()).or_insert((0, now));

        // Reset if window expired
        if now.duration_since(entry.1) > self.window {
            *entry = (1, now);
            return true;
        }

        if entry.0 < self.max_requests {
            entry.0 += 1;
            true
        } else {
            false
        }
    }

    /// Periodic cleanup of old entries
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.len();
        state.retain(|_, (_, time)| now.duration_since(*time) <= self.window * 2);
        before - state.len()
    }
}

/// Rate limiting middleware. Authenticated clients are counted per session
/// token, everyone else per remote address.
pub async fn rate_limit_middleware(
    limiter: Arc<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = match bearer_token(&request) {
        Some(token) => format!("token:{}", token),
        None => {
            let ip = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            format!("ip:{}", ip)
        }
    };

    if !limiter.check(&key).await {
        tracing::warn!(client = %key, "rate limit exceeded");
        return Err(AppError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_blocks_after_budget_per_key() {
        let limiter = RateLimiter::new(2, 60);
        assert!(limiter.check("a").await);
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
        assert!(limiter.check("b").await);
    }

    #[tokio::test]
    async fn cleanup_keeps_fresh_entries() {
        let limiter = RateLimiter::new(5, 60);
        limiter.check("a").await;
        assert_eq!(limiter.cleanup().await, 0);
    }
}
