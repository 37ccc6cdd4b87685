//! Shared setup for the Postgres-backed integration tests.
//! Requires DATABASE_TEST_URL (or DIALECTIC_TESTCONTAINERS=1); otherwise tests skip.

#![allow(dead_code)]

use std::sync::Arc;

use dialectic_core::{AppConfig, FileConfig, SourceType, WorkerDeps};
use dialectic_domains::content::ContentItem;
use dialectic_domains::queue::{JobPayload, JobQueue};
use dialectic_domains::testutil::{test_db, TestDb};
use dialectic_domains::{AnalysisWorker, PgContentSource};
use discourse_client::fake::FakeEngine;
use sqlx::PgPool;
use uuid::Uuid;

pub const DIM: usize = 768;

pub struct Harness {
    pub db: TestDb,
    pub engine: Arc<FakeEngine>,
    pub deps: Arc<WorkerDeps>,
    pub queue: JobQueue,
    pub worker: AnalysisWorker,
}

impl Harness {
    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Submit a post and return it with the payload a worker would receive.
    pub async fn post(&self, text: &str) -> (ContentItem, JobPayload) {
        let (item, _) = ContentItem::submit_post(Some(Uuid::new_v4()), text, &self.queue, self.pool())
            .await
            .unwrap();
        let payload = payload(SourceType::Post, item.id, text);
        (item, payload)
    }
}

pub fn payload(source_type: SourceType, source_id: Uuid, content: &str) -> JobPayload {
    JobPayload {
        source_type,
        source_id,
        content: content.to_string(),
    }
}

pub fn app_config() -> AppConfig {
    AppConfig {
        database_url: String::new(),
        discourse_engine_url: "http://fake".to_string(),
        discourse_engine_api_key: None,
        worker_id: "test-worker".to_string(),
    }
}

pub async fn harness() -> Option<Harness> {
    harness_with(FileConfig::default()).await
}

pub async fn harness_with(file_config: FileConfig) -> Option<Harness> {
    let db = test_db().await?;
    let engine = Arc::new(FakeEngine::new(DIM));
    let deps = Arc::new(WorkerDeps::new(
        db.pool.clone(),
        engine.clone(),
        app_config(),
        Arc::new(file_config.clone()),
    ));
    let queue = JobQueue::new(db.pool.clone(), file_config.queue.clone());
    let worker = AnalysisWorker::new(deps.clone(), Arc::new(PgContentSource::new(db.pool.clone())));
    Some(Harness {
        db,
        engine,
        deps,
        queue,
        worker,
    })
}

/// Unit basis vector `e_i` of the stored width.
pub fn basis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

pub async fn count(pool: &PgPool, sql: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql).fetch_one(pool).await.unwrap();
    n
}
