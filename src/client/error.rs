use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::media::MediaAccessError;
use crate::error::AppError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User is busy")]
    Busy,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited by the signaling server")]
    RateLimited,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Connection failed after {attempts} reconnection attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("Connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Invalid call state: {0}")]
    InvalidState(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl ClientError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::NetworkTimeout(_)
                | ClientError::Network(_)
                | ClientError::Storage(_)
                | ClientError::RateLimited
        )
    }

    /// Maps a non-success HTTP response to an error, preferring the `code`
    /// the server put in the body over the bare status.
    pub fn from_response(status: u16, body: &str) -> Self {
        if let Ok(ErrorBody { error, code }) = serde_json::from_str::<ErrorBody>(body) {
            return match code.as_str() {
                "unauthorized" => ClientError::Unauthorized(error),
                "validation" => ClientError::Validation(error),
                "busy" => ClientError::Busy,
                "not_found" => ClientError::NotFound(error),
                "rate_limited" => ClientError::RateLimited,
                "storage" => ClientError::Storage(error),
                _ => ClientError::Server(error),
            };
        }

        let detail = format!("HTTP {}: {}", status, body);
        match status {
            401 => ClientError::Unauthorized(detail),
            400 | 422 => ClientError::Validation(detail),
            404 => ClientError::NotFound(detail),
            409 => ClientError::Busy,
            408 => ClientError::NetworkTimeout(detail),
            429 => ClientError::RateLimited,
            502..=504 => ClientError::Network(detail),
            _ => ClientError::Server(detail),
        }
    }
}

impl From<AppError> for ClientError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Unauthorized(msg) => ClientError::Unauthorized(msg),
            AppError::Validation(msg) => ClientError::Validation(msg),
            AppError::Busy => ClientError::Busy,
            AppError::NotFound(msg) => ClientError::NotFound(msg),
            AppError::RateLimited => ClientError::RateLimited,
            AppError::Storage(e) => ClientError::Storage(e.to_string()),
            AppError::Config(msg) | AppError::Internal(msg) => ClientError::Server(msg),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::NetworkTimeout(err.to_string())
        } else if err.is_decode() {
            ClientError::Protocol(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}
