//! Presence store and signal mailbox operations, shared by the HTTP handlers
//! and the in-process client transport.

use std::sync::Arc;

use serde_json::Value;
use sqlx::{Pool, Sqlite};

use crate::config::Config;
use crate::db::{SignalRepository, UserRepository};
use crate::error::AppError;
use crate::signal::{is_empty_payload, CallKind, OutgoingSignal, PresenceEntry, Signal, SignalKind, SignalPayload, UserStatus};

#[derive(Clone)]
pub struct SignalingService {
    db: Pool<Sqlite>,
    config: Arc<Config>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SignalingService {
    pub fn new(db: Pool<Sqlite>, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.db
    }

    /// Everyone but `user_id`, online first, then on_call, then offline.
    /// Stale online users are demoted before the read.
    pub async fn list_presence(&self, user_id: &str) -> Result<Vec<PresenceEntry>, AppError> {
        let staleness = self.config.presence_staleness().as_millis() as i64;
        let demoted = UserRepository::demote_stale(&self.db, now_millis() - staleness).await?;
        if demoted > 0 {
            tracing::debug!(demoted, "demoted stale users to offline");
        }

        UserRepository::list_excluding(&self.db, user_id)
            .await?
            .into_iter()
            .map(PresenceEntry::try_from)
            .collect()
    }

    pub async fn set_status(&self, user_id: &str, status: UserStatus) -> Result<(), AppError> {
        if !UserRepository::set_status(&self.db, user_id, status, now_millis()).await? {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }

        tracing::debug!(user_id, %status, "status updated");
        Ok(())
    }

    /// Appends a signal and returns its id. A `call-request` goes through
    /// the same busy guard as [`send_call_request`](Self::send_call_request).
    pub async fn send_signal(&self, from_user: &str, signal: OutgoingSignal) -> Result<i64, AppError> {
        let payload = validate_payload(signal.kind, &signal.payload)?;

        if signal.to_user == from_user {
            return Err(AppError::Validation("Cannot signal yourself".to_string()));
        }

        if signal.kind == SignalKind::CallRequest {
            return self
                .invite(from_user, &signal.to_user, &payload, signal.call_kind)
                .await;
        }

        if UserRepository::get_by_id(&self.db, &signal.to_user).await?.is_none() {
            return Err(AppError::NotFound(format!("User {} not found", signal.to_user)));
        }

        let id = SignalRepository::create(
            &self.db,
            from_user,
            &signal.to_user,
            signal.kind,
            &payload,
            signal.call_kind,
        )
        .await?;

        tracing::debug!(signal_id = id, from_user, to_user = %signal.to_user, kind = %signal.kind, "signal stored");
        Ok(id)
    }

    /// Writes an invitation unless the callee is on a call.
    pub async fn send_call_request(
        &self,
        from_user: &str,
        to_user: &str,
        call_kind: CallKind,
    ) -> Result<i64, AppError> {
        if to_user == from_user {
            return Err(AppError::Validation("Cannot call yourself".to_string()));
        }

        let payload = SignalPayload::Invitation { call_kind }.to_value().to_string();
        self.invite(from_user, to_user, &payload, call_kind).await
    }

    async fn invite(
        &self,
        from_user: &str,
        to_user: &str,
        payload: &str,
        call_kind: CallKind,
    ) -> Result<i64, AppError> {
        match SignalRepository::create_invitation(&self.db, from_user, to_user, payload, call_kind).await {
            Ok(id) => {
                tracing::info!(signal_id = id, from_user, to_user, %call_kind, "call invitation sent");
                Ok(id)
            }
            Err(AppError::Busy) => {
                tracing::info!(from_user, to_user, "invitation refused: callee is on a call");
                Err(AppError::Busy)
            }
            Err(e) => Err(e),
        }
    }

    /// Unconsumed signals for `user_id` in insertion order. Everything except
    /// `call-request` and `call-accepted` is consumed by this read.
    pub async fn fetch_signals(&self, user_id: &str) -> Result<Vec<Signal>, AppError> {
        SignalRepository::fetch_unconsumed(&self.db, user_id)
            .await?
            .into_iter()
            .map(Signal::try_from)
            .collect()
    }

    /// Removes signals from `from_user` in the caller's own inbox and returns
    /// how many went away.
    pub async fn delete_signals(
        &self,
        user_id: &str,
        from_user: &str,
        kind: Option<SignalKind>,
    ) -> Result<u64, AppError> {
        let deleted = SignalRepository::delete_from(&self.db, user_id, from_user, kind).await?;
        tracing::debug!(user_id, from_user, kind = ?kind, deleted, "signals deleted");
        Ok(deleted)
    }

    /// Drops consumed signals older than the retention window.
    pub async fn purge_consumed(&self) -> Result<u64, AppError> {
        let retention = self.config.signal_retention().as_millis() as i64;
        SignalRepository::purge_consumed_before(&self.db, now_millis() - retention).await
    }
}

/// Rejects empty payloads and payloads that do not fit their kind, and
/// returns the JSON text to store.
fn validate_payload(kind: SignalKind, payload: &Value) -> Result<String, AppError> {
    if is_empty_payload(payload) {
        return Err(AppError::Validation(format!("{} payload must not be empty", kind)));
    }

    SignalPayload::decode(kind, payload).map_err(|e| AppError::Validation(e.to_string()))?;

    Ok(payload.to_string())
}
