use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dialectic_core::{Reconciliation, RunStatus, SourceType};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub source_type: String,
    pub source_id: Uuid,
    pub content_hash: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of asking for the active run of a source.
#[derive(Debug, Clone)]
pub enum RunSlot {
    /// The caller owns this run for the current attempt.
    Ready(AnalysisRun),
    /// Another attempt is processing different content for the same source.
    Busy(AnalysisRun),
}

impl AnalysisRun {
    pub fn run_status(&self) -> Result<RunStatus> {
        self.status.parse().map_err(Into::into)
    }

    pub fn source(&self) -> Result<SourceType> {
        self.source_type.parse().map_err(Into::into)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM analysis_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// All runs for a source, newest first.
    pub async fn find_for_source(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM analysis_runs
            WHERE source_type = $1 AND source_id = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn latest_completed(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM analysis_runs
            WHERE source_type = $1 AND source_id = $2 AND status = 'completed'
            ORDER BY completed_at DESC NULLS LAST, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// The source's pending or processing run, if any.
    pub async fn find_active(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM analysis_runs
            WHERE source_type = $1 AND source_id = $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Record that analysis of this content is wanted.
    ///
    /// Reuses a pending run (pointing it at the new hash). Returns `None` when a
    /// run is already processing; the worker opens a fresh run once that one
    /// finishes.
    pub async fn ensure_pending(
        source_type: SourceType,
        source_id: Uuid,
        content_hash: &str,
        executor: impl PgExecutor<'_>,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO analysis_runs (source_type, source_id, content_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_type, source_id) WHERE status IN ('pending', 'processing')
            DO UPDATE SET content_hash = EXCLUDED.content_hash
                WHERE analysis_runs.status = 'pending'
            RETURNING *
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(content_hash)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// Load (or open) the active run a worker attempt should drive.
    pub async fn find_or_create_active(
        source_type: SourceType,
        source_id: Uuid,
        content_hash: &str,
        pool: &PgPool,
    ) -> Result<RunSlot> {
        let mut tx = pool.begin().await?;

        let existing = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM analysis_runs
            WHERE source_type = $1 AND source_id = $2
              AND status IN ('pending', 'processing')
            FOR UPDATE
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?;

        let slot = match existing {
            None => {
                let run = sqlx::query_as::<_, Self>(
                    r#"
                    INSERT INTO analysis_runs (source_type, source_id, content_hash)
                    VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING
                    RETURNING *
                    "#,
                )
                .bind(source_type.as_str())
                .bind(source_id)
                .bind(content_hash)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    anyhow!("concurrent run created for {source_type} {source_id}")
                })?;
                RunSlot::Ready(run)
            }
            Some(run) if run.status == RunStatus::Pending.as_str() => {
                let run = sqlx::query_as::<_, Self>(
                    "UPDATE analysis_runs SET content_hash = $2 WHERE id = $1 RETURNING *",
                )
                .bind(run.id)
                .bind(content_hash)
                .fetch_one(&mut *tx)
                .await?;
                RunSlot::Ready(run)
            }
            // Redelivery of the same content after a lapsed lease: take over.
            Some(run) if run.content_hash == content_hash => RunSlot::Ready(run),
            Some(run) => RunSlot::Busy(run),
        };

        tx.commit().await?;
        Ok(slot)
    }

    pub async fn mark_processing(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE analysis_runs
            SET status = 'processing', error_message = NULL
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("analysis run {id} is not pending"))
    }

    pub async fn mark_completed(id: Uuid, note: Option<&str>, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE analysis_runs
            SET status = 'completed', error_message = $2, completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(note)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("analysis run {id} is not active"))
    }

    pub async fn mark_failed(id: Uuid, error_message: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE analysis_runs
            SET status = 'failed', error_message = $2, completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error_message)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("analysis run {id} is not active"))
    }

    /// Fail a source's pending run (e.g. its content was deleted).
    pub async fn fail_pending_for_source(
        source_type: SourceType,
        source_id: Uuid,
        error_message: &str,
        pool: &PgPool,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'failed', error_message = $3, completed_at = now()
            WHERE source_type = $1 AND source_id = $2 AND status = 'pending'
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Close the pending run for exactly this content as completed with `note`.
    pub async fn close_pending_for_hash(
        source_type: SourceType,
        source_id: Uuid,
        content_hash: &str,
        note: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE analysis_runs
            SET status = 'completed', error_message = $4, completed_at = now()
            WHERE source_type = $1 AND source_id = $2
              AND status = 'pending' AND content_hash = $3
            RETURNING *
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(content_hash)
        .bind(note)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Lock every run left in `processing`. Caller holds the transaction.
    pub async fn lock_processing(conn: &mut PgConnection) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM analysis_runs
            WHERE status = 'processing'
            ORDER BY created_at
            FOR UPDATE
            "#,
        )
        .fetch_all(conn)
        .await
        .map_err(Into::into)
    }

    pub async fn apply_reconciliation(
        id: Uuid,
        reconciliation: &Reconciliation,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        let completed = reconciliation.status.is_terminal();
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE analysis_runs
            SET status = $2,
                error_message = $3,
                completed_at = CASE WHEN $4 THEN now() ELSE NULL END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reconciliation.status.as_str())
        .bind(reconciliation.note)
        .bind(completed)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    pub async fn count_by_status(status: RunStatus, pool: &PgPool) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM analysis_runs WHERE status = $1",
        )
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }
}
