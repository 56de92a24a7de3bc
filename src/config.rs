use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub request_timeout_secs: u64,
    /// Online users whose last heartbeat is older than this read as offline.
    pub presence_stale_secs: u64,
    pub rate_limit_per_minute: u32,
    /// Consumed signals older than this are purged by the maintenance task.
    pub signal_retention_secs: u64,
    pub session_expiry_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            database_url: "sqlite://peercall.db".to_string(),
            db_max_connections: 20,
            db_min_connections: 5,
            request_timeout_secs: 30,
            presence_stale_secs: 15,
            rate_limit_per_minute: 1200,
            signal_retention_secs: 3600,
            session_expiry_hours: 24,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let config = Config {
            server_host: env_or("SERVER_HOST", defaults.server_host)?,
            server_port: env_or("SERVER_PORT", defaults.server_port)?,
            database_url: env_or("DATABASE_URL", defaults.database_url)?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_min_connections: env_or("DB_MIN_CONNECTIONS", defaults.db_min_connections)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            presence_stale_secs: env_or("PRESENCE_STALE_SECS", defaults.presence_stale_secs)?,
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute)?,
            signal_retention_secs: env_or("SIGNAL_RETENTION_SECS", defaults.signal_retention_secs)?,
            session_expiry_hours: env_or("SESSION_EXPIRY_HOURS", defaults.session_expiry_hours)?,
        };

        if config.db_min_connections > config.db_max_connections {
            return Err(AppError::Config(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                config.db_min_connections, config.db_max_connections
            )));
        }

        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn presence_staleness(&self) -> Duration {
        Duration::from_secs(self.presence_stale_secs)
    }

    pub fn signal_retention(&self) -> Duration {
        Duration::from_secs(self.signal_retention_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
