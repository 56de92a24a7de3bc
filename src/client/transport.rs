//! How a client reaches the presence store and the mailbox. Polling over
//! HTTP is one implementation; nothing above this trait depends on it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::presence::StatusResponse;
use crate::api::signals::{DeleteSignalsResponse, SendSignalResponse};
use crate::client::error::ClientError;
use crate::service::SignalingService;
use crate::signal::{CallKind, OutgoingSignal, PresenceEntry, Signal, SignalKind, UserStatus};

/// The authenticated user's view of the signaling service.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn list_users(&self) -> Result<Vec<PresenceEntry>, ClientError>;

    async fn set_status(&self, status: UserStatus) -> Result<(), ClientError>;

    /// Returns the id of the stored signal.
    async fn send_signal(&self, signal: &OutgoingSignal) -> Result<i64, ClientError>;

    async fn send_call_request(&self, to_user: &str, call_kind: CallKind) -> Result<i64, ClientError>;

    async fn fetch_signals(&self) -> Result<Vec<Signal>, ClientError>;

    /// Returns how many signals were removed; zero is not an error.
    async fn delete_signals(&self, from_user: &str, kind: Option<SignalKind>) -> Result<u64, ClientError>;
}

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct StatusBody {
    status: UserStatus,
}

#[derive(Serialize)]
struct CallBody<'a> {
    to_user: &'a str,
    call_kind: CallKind,
}

#[derive(Serialize)]
struct DeleteBody<'a> {
    from_user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<SignalKind>,
}

/// Talks to the HTTP API with a bearer session token.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    fetch_timeout: Duration,
    send_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, session_token: &str) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", session_token))
                .map_err(|e| ClientError::Validation(format!("invalid session token: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetch_timeout: FETCH_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
        })
    }

    pub fn with_timeouts(mut self, fetch: Duration, send: Duration) -> Self {
        self.fetch_timeout = fetch;
        self.send_timeout = send;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        decode(response).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.send_timeout)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Protocol(format!("invalid response body: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = %status, body = %body, "signaling request failed");
    Err(ClientError::from_response(status.as_u16(), &body))
}

#[async_trait]
impl SignalingTransport for HttpTransport {
    async fn list_users(&self) -> Result<Vec<PresenceEntry>, ClientError> {
        self.get("/api/users").await
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ClientError> {
        let _: StatusResponse = self.post("/api/status", &StatusBody { status }).await?;
        Ok(())
    }

    async fn send_signal(&self, signal: &OutgoingSignal) -> Result<i64, ClientError> {
        let response: SendSignalResponse = self.post("/api/signals", signal).await?;
        Ok(response.signal_id)
    }

    async fn send_call_request(&self, to_user: &str, call_kind: CallKind) -> Result<i64, ClientError> {
        let response: SendSignalResponse = self
            .post("/api/calls", &CallBody { to_user, call_kind })
            .await?;
        Ok(response.signal_id)
    }

    async fn fetch_signals(&self) -> Result<Vec<Signal>, ClientError> {
        self.get("/api/signals").await
    }

    async fn delete_signals(&self, from_user: &str, kind: Option<SignalKind>) -> Result<u64, ClientError> {
        let response: DeleteSignalsResponse = self
            .post("/api/signals/delete", &DeleteBody { from_user, kind })
            .await?;
        Ok(response.deleted)
    }
}

/// Calls the service directly, for clients embedded in the server process.
#[derive(Clone)]
pub struct LocalTransport {
    service: SignalingService,
    user_id: String,
}

impl LocalTransport {
    pub fn new(service: SignalingService, user_id: impl Into<String>) -> Self {
        Self {
            service,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl SignalingTransport for LocalTransport {
    async fn list_users(&self) -> Result<Vec<PresenceEntry>, ClientError> {
        Ok(self.service.list_presence(&self.user_id).await?)
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ClientError> {
        Ok(self.service.set_status(&self.user_id, status).await?)
    }

    async fn send_signal(&self, signal: &OutgoingSignal) -> Result<i64, ClientError> {
        Ok(self.service.send_signal(&self.user_id, signal.clone()).await?)
    }

    async fn send_call_request(&self, to_user: &str, call_kind: CallKind) -> Result<i64, ClientError> {
        Ok(self.service.send_call_request(&self.user_id, to_user, call_kind).await?)
    }

    async fn fetch_signals(&self) -> Result<Vec<Signal>, ClientError> {
        Ok(self.service.fetch_signals(&self.user_id).await?)
    }

    async fn delete_signals(&self, from_user: &str, kind: Option<SignalKind>) -> Result<u64, ClientError> {
        Ok(self.service.delete_signals(&self.user_id, from_user, kind).await?)
    }
}
