use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::AuthUser;
use crate::api::state::AppState;
use crate::error::AppError;
use crate::signal::{PresenceEntry, UserStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: UserStatus,
}

/// GET /api/users (requires auth)
pub async fn list_users(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<PresenceEntry>>, AppError> {
    let users = state.service.list_presence(&user_id).await?;
    Ok(Json(users))
}

/// POST /api/status (requires auth)
pub async fn update_status(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    let Json(req) = body?;
    state.service.set_status(&user_id, req.status).await?;
    Ok(Json(StatusResponse { status: req.status }))
}
