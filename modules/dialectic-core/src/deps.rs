use crate::config::AppConfig;
use crate::file_config::FileConfig;
use discourse_client::DiscourseEngine;
use sqlx::PgPool;
use std::sync::Arc;

/// Central dependency container passed to the worker, deduplicator and recovery.
#[derive(Clone)]
pub struct WorkerDeps {
    pub db_pool: PgPool,
    pub engine: Arc<dyn DiscourseEngine>,
    pub config: AppConfig,
    pub file_config: Arc<FileConfig>,
}

impl WorkerDeps {
    pub fn new(
        db_pool: PgPool,
        engine: Arc<dyn DiscourseEngine>,
        config: AppConfig,
        file_config: Arc<FileConfig>,
    ) -> Self {
        Self {
            db_pool,
            engine,
            config,
            file_config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db_pool
    }
}
