use std::sync::Arc;
use sqlx::{Pool, Sqlite};
use crate::config::Config;
use crate::service::SignalingService;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Sqlite>,
    pub service: SignalingService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Pool<Sqlite>, config: Arc<Config>) -> Self {
        Self {
            service: SignalingService::new(db.clone(), config.clone()),
            db,
            config,
        }
    }
}
