pub mod models;
pub mod users;
pub mod sessions;
pub mod signals;

pub use models::{User, Session, SignalRow};
pub use users::UserRepository;
pub use sessions::SessionRepository;
pub use signals::SignalRepository;

use sqlx::{Pool, Sqlite};
use crate::error::AppError;

pub async fn migrate(pool: &Pool<Sqlite>) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub(crate) async fn memory_pool() -> Pool<Sqlite> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    migrate(&pool).await.expect("migrations");
    pool
}
