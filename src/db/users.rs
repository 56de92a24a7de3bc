use sqlx::{Pool, Sqlite};
use uuid::Uuid;
use crate::db::models::User;
use crate::error::AppError;
use crate::signal::UserStatus;

pub struct UserRepository;

impl UserRepository {
    /// Accounts are provisioned by the external identity service; this is
    /// the write path it shares with us.
    pub async fn create(
        pool: &Pool<Sqlite>,
        username: &str,
        avatar_ref: Option<&str>,
    ) -> Result<User, AppError> {
        let id = Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().timestamp_millis();

        let user = sqlx::query_as::<_, User>(
            r#"
INSERT INTO users (id, username, avatar_ref, status, last_seen, created_at)
VALUES (?, ?, ?, 'offline', NULL, ?)
RETURNING *
            "#,
        )
        .bind(&id)
        .bind(username)
        .bind(avatar_ref)
        .bind(created_at)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }

    pub async fn get_by_id(
        pool: &Pool<Sqlite>,
        id: &str,
    ) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = ?"
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    /// Overwrites the status and stamps `last_seen`. Returns false when the
    /// user does not exist.
    pub async fn set_status(
        pool: &Pool<Sqlite>,
        id: &str,
        status: UserStatus,
        now: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE users SET status = ?, last_seen = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Demotes online users whose last heartbeat predates `threshold` (or who
    /// never sent one). on_call users are left alone.
    pub async fn demote_stale(
        pool: &Pool<Sqlite>,
        threshold: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
UPDATE users SET status = 'offline'
WHERE status = 'online' AND (last_seen IS NULL OR last_seen < ?)
            "#,
        )
        .bind(threshold)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_excluding(
        pool: &Pool<Sqlite>,
        excluded_id: &str,
    ) -> Result<Vec<User>, AppError> {
        let users = sqlx::query_as::<_, User>(
            r#"
SELECT * FROM users
WHERE id != ?
ORDER BY
    CASE status
        WHEN 'online' THEN 1
        WHEN 'on_call' THEN 2
        WHEN 'offline' THEN 3
        ELSE 4
    END ASC,
    username ASC
            "#
        )
        .bind(excluded_id)
        .fetch_all(pool)
        .await?;

        Ok(users)
    }
}
