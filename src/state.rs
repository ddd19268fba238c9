use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    cache::ResponseCache,
    config::AppConfig,
    db::create_pool,
    services::{extension_alerts::ExtensionAlertStore, realtime::ChangeFeed},
};

const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub report_cache: ResponseCache,
    pub change_feed: ChangeFeed,
    pub extension_alerts: Arc<ExtensionAlertStore>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, sqlx::Error> {
        let db_pool = create_pool(&config)?;
        Ok(Self::with_pool(config, db_pool))
    }

    pub fn with_pool(config: AppConfig, db_pool: Option<PgPool>) -> Self {
        let report_cache = ResponseCache::new(
            config.report_response_cache_ttl_seconds,
            config.report_response_cache_max_entries,
        );
        Self {
            config: Arc::new(config),
            db_pool,
            report_cache,
            change_feed: ChangeFeed::new(CHANGE_FEED_CAPACITY),
            extension_alerts: Arc::new(ExtensionAlertStore::new()),
        }
    }
}
