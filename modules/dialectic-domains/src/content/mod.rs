//! The slice of the content store the analysis pipeline touches: posts and
//! replies, their analysis status, and submission with an outboxed job.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialectic_core::{content_hash, RunStatus, SourceType};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::analysis::models::AnalysisRun;
use crate::queue::{JobHandle, JobQueue};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentItem {
    pub id: Uuid,
    pub source_type: String,
    pub author_id: Option<Uuid>,
    pub content: String,
    pub content_hash: String,
    pub analysis_status: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read access to live content, used to re-queue work and to detect stale
/// jobs. Deleted content reads as `None`.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, source_type: SourceType, source_id: Uuid)
        -> Result<Option<ContentItem>>;
}

pub struct PgContentSource {
    pool: PgPool,
}

impl PgContentSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentSource for PgContentSource {
    async fn fetch(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<Option<ContentItem>> {
        ContentItem::find(source_type, source_id, &self.pool).await
    }
}

impl ContentItem {
    pub fn source(&self) -> Result<SourceType> {
        self.source_type.parse().map_err(Into::into)
    }

    /// Live (not deleted) post or reply.
    pub async fn find(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            SELECT id, $2::text AS source_type, author_id, content, content_hash,
                   analysis_status, deleted_at, created_at, updated_at
            FROM {}
            WHERE id = $1 AND deleted_at IS NULL
            "#,
            source_type.table()
        );
        sqlx::query_as::<_, Self>(&sql)
            .bind(source_id)
            .bind(source_type.as_str())
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Create a post and, in the same transaction, its pending analysis run
    /// and queued job.
    pub async fn submit_post(
        author_id: Option<Uuid>,
        content: &str,
        queue: &JobQueue,
        pool: &PgPool,
    ) -> Result<(Self, JobHandle)> {
        let hash = content_hash(content);
        let mut tx = pool.begin().await?;

        let item = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO posts (author_id, content, content_hash)
            VALUES ($1, $2, $3)
            RETURNING id, 'post'::text AS source_type, author_id, content, content_hash,
                      analysis_status, deleted_at, created_at, updated_at
            "#,
        )
        .bind(author_id)
        .bind(content)
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await?;

        AnalysisRun::ensure_pending(SourceType::Post, item.id, &hash, &mut *tx).await?;
        let job = queue
            .enqueue_in(&mut *tx, SourceType::Post, item.id, content)
            .await?;

        tx.commit().await?;
        Ok((item, job))
    }

    /// Create a reply under `post_id`, with its run and job, atomically.
    pub async fn submit_reply(
        post_id: Uuid,
        author_id: Option<Uuid>,
        content: &str,
        queue: &JobQueue,
        pool: &PgPool,
    ) -> Result<(Self, JobHandle)> {
        let hash = content_hash(content);
        let mut tx = pool.begin().await?;

        let item = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO replies (post_id, author_id, content, content_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, 'reply'::text AS source_type, author_id, content, content_hash,
                      analysis_status, deleted_at, created_at, updated_at
            "#,
        )
        .bind(post_id)
        .bind(author_id)
        .bind(content)
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await?;

        AnalysisRun::ensure_pending(SourceType::Reply, item.id, &hash, &mut *tx).await?;
        let job = queue
            .enqueue_in(&mut *tx, SourceType::Reply, item.id, content)
            .await?;

        tx.commit().await?;
        Ok((item, job))
    }

    /// Edit live content. Enqueues re-analysis only when the text actually
    /// changed; returns `None` otherwise.
    pub async fn update_content(
        source_type: SourceType,
        source_id: Uuid,
        content: &str,
        queue: &JobQueue,
        pool: &PgPool,
    ) -> Result<Option<JobHandle>> {
        let hash = content_hash(content);
        let mut tx = pool.begin().await?;

        let sql = format!(
            r#"
            SELECT content_hash FROM {}
            WHERE id = $1 AND deleted_at IS NULL
            FOR UPDATE
            "#,
            source_type.table()
        );
        let (current,): (String,) = sqlx::query_as(&sql)
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("{source_type} {source_id} not found"))?;

        if current == hash {
            tx.rollback().await?;
            return Ok(None);
        }

        let sql = format!(
            r#"
            UPDATE {}
            SET content = $2, content_hash = $3, analysis_status = 'pending', updated_at = now()
            WHERE id = $1
            "#,
            source_type.table()
        );
        sqlx::query(&sql)
            .bind(source_id)
            .bind(content)
            .bind(&hash)
            .execute(&mut *tx)
            .await?;

        AnalysisRun::ensure_pending(source_type, source_id, &hash, &mut *tx).await?;
        let job = queue
            .enqueue_in(&mut *tx, source_type, source_id, content)
            .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    pub async fn soft_delete(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET deleted_at = now(), updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
            source_type.table()
        );
        let result = sqlx::query(&sql).bind(source_id).execute(pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mirror a run's status onto the content row for UI polling.
    pub async fn set_analysis_status(
        source_type: SourceType,
        source_id: Uuid,
        status: RunStatus,
        executor: impl PgExecutor<'_>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET analysis_status = $2 WHERE id = $1",
            source_type.table()
        );
        sqlx::query(&sql)
            .bind(source_id)
            .bind(status.as_str())
            .execute(executor)
            .await?;
        Ok(())
    }
}
