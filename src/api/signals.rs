use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::middleware::AuthUser;
use crate::api::state::AppState;
use crate::error::AppError;
use crate::signal::{CallKind, OutgoingSignal, Signal, SignalKind};

/// Body of `POST /api/signals`. `kind` stays a string here so unknown kinds
/// surface as validation errors rather than generic body rejections.
#[derive(Debug, Deserialize)]
pub struct SendSignalRequest {
    pub to_user: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub call_kind: CallKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendSignalResponse {
    pub signal_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub to_user: String,
    #[serde(default)]
    pub call_kind: CallKind,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSignalsRequest {
    pub from_user: String,
    pub kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteSignalsResponse {
    pub deleted: u64,
}

fn parse_kind(raw: &str) -> Result<SignalKind, AppError> {
    raw.parse::<SignalKind>()
        .map_err(|e| AppError::Validation(e.to_string()))
}

/// POST /api/signals (requires auth)
pub async fn send_signal(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<SendSignalRequest>, JsonRejection>,
) -> Result<Json<SendSignalResponse>, AppError> {
    let Json(req) = body?;
    let signal = OutgoingSignal {
        to_user: req.to_user,
        kind: parse_kind(&req.kind)?,
        payload: req.payload,
        call_kind: req.call_kind,
    };

    let signal_id = state.service.send_signal(&user_id, signal).await?;
    Ok(Json(SendSignalResponse { signal_id }))
}

/// POST /api/calls (requires auth)
pub async fn send_call_request(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<CallRequest>, JsonRejection>,
) -> Result<Json<SendSignalResponse>, AppError> {
    let Json(req) = body?;
    let signal_id = state
        .service
        .send_call_request(&user_id, &req.to_user, req.call_kind)
        .await?;
    Ok(Json(SendSignalResponse { signal_id }))
}

/// GET /api/signals (requires auth)
pub async fn fetch_signals(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<Signal>>, AppError> {
    let signals = state.service.fetch_signals(&user_id).await?;
    Ok(Json(signals))
}

/// POST /api/signals/delete (requires auth)
pub async fn delete_signals(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<DeleteSignalsRequest>, JsonRejection>,
) -> Result<Json<DeleteSignalsResponse>, AppError> {
    let Json(req) = body?;
    let kind = req.kind.as_deref().map(parse_kind).transpose()?;

    let deleted = state
        .service
        .delete_signals(&user_id, &req.from_user, kind)
        .await?;
    Ok(Json(DeleteSignalsResponse { deleted }))
}
