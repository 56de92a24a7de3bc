use sqlx::{Pool, Sqlite};
use uuid::Uuid;
use crate::db::models::SignalRow;
use crate::error::AppError;
use crate::signal::{CallKind, SignalKind};

pub struct SignalRepository;

const SELECT_INBOX: &str = r#"
SELECT s.id, s.from_user_id, u.username AS from_username, u.avatar_ref AS from_avatar_ref,
       s.kind, s.payload, s.call_kind, s.consumed, s.created_at
FROM signals s
JOIN users u ON s.from_user_id = u.id
"#;

/// SQL list literal of the kinds that survive reads, e.g. `('call-request', 'call-accepted')`.
fn sticky_kinds_sql() -> String {
    let kinds: Vec<String> = SignalKind::ALL
        .iter()
        .filter(|kind| kind.is_sticky())
        .map(|kind| format!("'{}'", kind.as_str()))
        .collect();
    format!("({})", kinds.join(", "))
}

impl SignalRepository {
    pub async fn create(
        pool: &Pool<Sqlite>,
        from_user_id: &str,
        to_user_id: &str,
        kind: SignalKind,
        payload: &str,
        call_kind: CallKind,
    ) -> Result<i64, AppError> {
        let created_at = chrono::Utc::now().timestamp_millis();

        let id = sqlx::query(
            r#"
INSERT INTO signals (from_user_id, to_user_id, kind, payload, call_kind, consumed, created_at)
VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(call_kind.as_str())
        .bind(created_at)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Writes a `call-request` unless the callee is on a call. The status
    /// check and the insert are one statement, so a callee that goes on_call
    /// concurrently can never end up with a fresh invitation.
    pub async fn create_invitation(
        pool: &Pool<Sqlite>,
        from_user_id: &str,
        to_user_id: &str,
        payload: &str,
        call_kind: CallKind,
    ) -> Result<i64, AppError> {
        let mut tx = pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM users WHERE id = ?")
            .bind(to_user_id)
            .fetch_optional(&mut *tx)
            .await?;

        match status.as_deref() {
            None => return Err(AppError::NotFound(format!("User {} not found", to_user_id))),
            Some("on_call") => return Err(AppError::Busy),
            Some(_) => {}
        }

        let created_at = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
INSERT INTO signals (from_user_id, to_user_id, kind, payload, call_kind, consumed, created_at)
SELECT ?, id, 'call-request', ?, ?, 0, ?
FROM users
WHERE id = ? AND status != 'on_call'
            "#,
        )
        .bind(from_user_id)
        .bind(payload)
        .bind(call_kind.as_str())
        .bind(created_at)
        .bind(to_user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Busy);
        }

        let id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(id)
    }

    /// Returns every unconsumed signal addressed to `to_user_id` in insertion
    /// order and consumes the non-sticky ones.
    ///
    /// The claim runs first and tags rows with a per-call token, so two
    /// overlapping fetches for the same inbox never both receive the same
    /// non-sticky signal. Sticky rows are returned to every fetch until they
    /// are deleted.
    pub async fn fetch_unconsumed(
        pool: &Pool<Sqlite>,
        to_user_id: &str,
    ) -> Result<Vec<SignalRow>, AppError> {
        let claim_token = Uuid::new_v4().to_string();
        let sticky = sticky_kinds_sql();

        let mut tx = pool.begin().await?;

        sqlx::query(&format!(
            r#"
UPDATE signals SET consumed = 1, claim_token = ?
WHERE to_user_id = ? AND consumed = 0 AND kind NOT IN {}
            "#,
            sticky
        ))
        .bind(&claim_token)
        .bind(to_user_id)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, SignalRow>(&format!(
            r#"{}
WHERE s.to_user_id = ?
  AND (s.claim_token = ? OR (s.consumed = 0 AND s.kind IN {}))
ORDER BY s.id ASC
            "#,
            SELECT_INBOX, sticky
        ))
        .bind(to_user_id)
        .bind(&claim_token)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows)
    }

    /// Deletes signals from `from_user_id` in `to_user_id`'s inbox, all of
    /// them or only one kind. Deleting nothing is not an error.
    pub async fn delete_from(
        pool: &Pool<Sqlite>,
        to_user_id: &str,
        from_user_id: &str,
        kind: Option<SignalKind>,
    ) -> Result<u64, AppError> {
        let result = match kind {
            Some(kind) => {
                sqlx::query("DELETE FROM signals WHERE to_user_id = ? AND from_user_id = ? AND kind = ?")
                    .bind(to_user_id)
                    .bind(from_user_id)
                    .bind(kind.as_str())
                    .execute(pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM signals WHERE to_user_id = ? AND from_user_id = ?")
                    .bind(to_user_id)
                    .bind(from_user_id)
                    .execute(pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }

    /// Number of signals (consumed or not) sitting in an inbox.
    pub async fn count_addressed_to(
        pool: &Pool<Sqlite>,
        to_user_id: &str,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM signals WHERE to_user_id = ?")
            .bind(to_user_id)
            .fetch_one(pool)
            .await?;

        Ok(count)
    }

    pub async fn purge_consumed_before(
        pool: &Pool<Sqlite>,
        cutoff: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM signals WHERE consumed = 1 AND created_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_pool, UserRepository};
    use crate::signal::UserStatus;

    async fn pair(pool: &Pool<Sqlite>) -> (String, String) {
        let alice = UserRepository::create(pool, "alice", None).await.unwrap();
        let bob = UserRepository::create(pool, "bob", Some("bob.png")).await.unwrap();
        (alice.id, bob.id)
    }

    #[test]
    fn sticky_list_names_request_and_accept() {
        assert_eq!(sticky_kinds_sql(), "('call-request', 'call-accepted')");
    }

    #[tokio::test]
    async fn fetch_consumes_everything_but_sticky_kinds() {
        let pool = memory_pool().await;
        let (alice, bob) = pair(&pool).await;

        let request = SignalRepository::create(&pool, &alice, &bob, SignalKind::CallRequest, "{}", CallKind::Video)
            .await
            .unwrap();
        let offer = SignalRepository::create(&pool, &alice, &bob, SignalKind::Offer, "{}", CallKind::Video)
            .await
            .unwrap();

        let first = SignalRepository::fetch_unconsumed(&pool, &bob).await.unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![request, offer]);
        assert_eq!(first[0].from_username, "alice");

        let second = SignalRepository::fetch_unconsumed(&pool, &bob).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), vec![request]);
        assert!(!second[0].consumed);
    }

    #[tokio::test]
    async fn fetch_only_sees_own_inbox() {
        let pool = memory_pool().await;
        let (alice, bob) = pair(&pool).await;

        SignalRepository::create(&pool, &alice, &bob, SignalKind::Answer, "{}", CallKind::Audio)
            .await
            .unwrap();

        assert!(SignalRepository::fetch_unconsumed(&pool, &alice).await.unwrap().is_empty());
        assert_eq!(SignalRepository::fetch_unconsumed(&pool, &bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invitation_to_busy_user_writes_nothing() {
        let pool = memory_pool().await;
        let (alice, bob) = pair(&pool).await;
        UserRepository::set_status(&pool, &bob, UserStatus::OnCall, 0).await.unwrap();

        let err = SignalRepository::create_invitation(&pool, &alice, &bob, "{}", CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Busy));
        assert_eq!(SignalRepository::count_addressed_to(&pool, &bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invitation_to_unknown_user_is_not_found() {
        let pool = memory_pool().await;
        let (alice, _) = pair(&pool).await;

        let err = SignalRepository::create_invitation(&pool, &alice, "ghost", "{}", CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_scoped_by_sender_and_kind() {
        let pool = memory_pool().await;
        let (alice, bob) = pair(&pool).await;
        let carol = UserRepository::create(&pool, "carol", None).await.unwrap().id;

        for kind in [SignalKind::CallRequest, SignalKind::CallEnded] {
            SignalRepository::create(&pool, &alice, &bob, kind, "{}", CallKind::Video).await.unwrap();
        }
        SignalRepository::create(&pool, &carol, &bob, SignalKind::CallRequest, "{}", CallKind::Video)
            .await
            .unwrap();

        let removed = SignalRepository::delete_from(&pool, &bob, &alice, Some(SignalKind::CallEnded))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let again = SignalRepository::delete_from(&pool, &bob, &alice, Some(SignalKind::CallEnded))
            .await
            .unwrap();
        assert_eq!(again, 0);

        let all = SignalRepository::delete_from(&pool, &bob, &alice, None).await.unwrap();
        assert_eq!(all, 1);
        assert_eq!(SignalRepository::count_addressed_to(&pool, &bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_keeps_unconsumed_signals() {
        let pool = memory_pool().await;
        let (alice, bob) = pair(&pool).await;

        SignalRepository::create(&pool, &alice, &bob, SignalKind::Offer, "{}", CallKind::Video).await.unwrap();
        SignalRepository::create(&pool, &alice, &bob, SignalKind::CallRequest, "{}", CallKind::Video)
            .await
            .unwrap();
        SignalRepository::fetch_unconsumed(&pool, &bob).await.unwrap();

        let future = chrono::Utc::now().timestamp_millis() + 1_000;
        let purged = SignalRepository::purge_consumed_before(&pool, future).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(SignalRepository::count_addressed_to(&pool, &bob).await.unwrap(), 1);
    }
}
