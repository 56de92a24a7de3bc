use sqlx::FromRow;

use crate::error::AppError;
use crate::signal::{CallKind, PresenceEntry, Signal, SignalKind, UserStatus};

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub avatar_ref: Option<String>,
    pub status: String,
    pub last_seen: Option<i64>,
    pub created_at: i64,
}

impl User {
    pub fn status(&self) -> Result<UserStatus, AppError> {
        self.status
            .parse::<UserStatus>()
            .map_err(|e| AppError::Internal(format!("Corrupt user row {}: {}", self.id, e)))
    }
}

impl TryFrom<User> for PresenceEntry {
    type Error = AppError;

    fn try_from(user: User) -> Result<Self, Self::Error> {
        let status = user.status()?;
        Ok(PresenceEntry {
            id: user.id,
            username: user.username,
            avatar_ref: user.avatar_ref,
            status,
            last_seen: user.last_seen,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SignalRow {
    pub id: i64,
    pub from_user_id: String,
    pub from_username: String, // Joined from users table
    pub from_avatar_ref: Option<String>,
    pub kind: String,
    pub payload: String,
    pub call_kind: String,
    pub consumed: bool,
    pub created_at: i64,
}

impl TryFrom<SignalRow> for Signal {
    type Error = AppError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| {
            AppError::Internal(format!("Corrupt signal {} ({}): {}", row.id, what, detail))
        };

        let kind = row
            .kind
            .parse::<SignalKind>()
            .map_err(|e| corrupt("kind", e.to_string()))?;
        let call_kind = row
            .call_kind
            .parse::<CallKind>()
            .map_err(|e| corrupt("call_kind", e.to_string()))?;
        let payload =
            serde_json::from_str::<serde_json::Value>(&row.payload).map_err(|e| corrupt("payload", e.to_string()))?;

        Ok(Signal {
            id: row.id,
            from_user: row.from_user_id,
            from_username: row.from_username,
            from_avatar_ref: row.from_avatar_ref,
            kind,
            payload,
            call_kind,
        })
    }
}
