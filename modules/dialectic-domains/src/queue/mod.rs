//! Durable analysis job queue on Postgres.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED` under a lease. A worker that
//! dies mid-job simply stops renewing: once the lease lapses the job is
//! claimable again. Delivery is at-least-once, so the worker must be
//! idempotent per content version.

pub mod job;

pub use job::{AnalysisJob, FailOutcome, JobEvent, JobHandle, JobPayload, JobStatus};

use anyhow::{Context, Result};
use chrono::Utc;
use dialectic_core::{content_hash, QueueConfig, SourceType};
use sqlx::{PgExecutor, PgPool};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: QueueConfig,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            config,
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Completion and failure notifications. Lagging receivers drop events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn enqueue(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        content: &str,
    ) -> Result<JobHandle> {
        self.enqueue_in(&self.pool, source_type, source_id, content)
            .await
    }

    /// Enqueue on the caller's executor, so the job commits (or not) with the
    /// caller's transaction.
    ///
    /// Identical content for a source that is already queued or running is
    /// not enqueued twice; the existing job's handle comes back instead.
    pub async fn enqueue_in(
        &self,
        executor: impl PgExecutor<'_>,
        source_type: SourceType,
        source_id: Uuid,
        content: &str,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(JobPayload {
            source_type,
            source_id,
            content: content.to_string(),
        })?;

        let (id, created) = sqlx::query_as::<_, (Uuid, bool)>(
            r#"
            INSERT INTO analysis_jobs (source_type, source_id, content_hash, payload, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_type, source_id, content_hash)
                WHERE status IN ('queued', 'active')
            DO UPDATE SET updated_at = now()
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(content_hash(content))
        .bind(payload)
        .bind(self.config.max_attempts)
        .fetch_one(executor)
        .await
        .with_context(|| format!("enqueue analysis of {source_type} {source_id}"))?;

        if created {
            debug!(job_id = %id, %source_type, %source_id, "Analysis job enqueued");
        } else {
            debug!(
                job_id = %id,
                %source_type,
                %source_id,
                "Identical analysis job already in flight"
            );
        }
        Ok(JobHandle { id, created })
    }

    /// Queue fresh work for content whose previous job is presumed lost.
    ///
    /// Unlike `enqueue`, an in-flight row for the same content is revived
    /// rather than returned as is: it goes back to `queued`, due now, unowned,
    /// with its attempt budget restored.
    pub async fn requeue(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        content: &str,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(JobPayload {
            source_type,
            source_id,
            content: content.to_string(),
        })?;

        let (id, created) = sqlx::query_as::<_, (Uuid, bool)>(
            r#"
            INSERT INTO analysis_jobs (source_type, source_id, content_hash, payload, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_type, source_id, content_hash)
                WHERE status IN ('queued', 'active')
            DO UPDATE SET status = 'queued', attempts = 0, run_at = now(),
                locked_by = NULL, lease_expires_at = NULL,
                max_attempts = EXCLUDED.max_attempts, updated_at = now()
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(content_hash(content))
        .bind(payload)
        .bind(self.config.max_attempts)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("requeue analysis of {source_type} {source_id}"))?;

        debug!(job_id = %id, %source_type, %source_id, created, "Analysis job requeued");
        Ok(JobHandle { id, created })
    }

    /// Claim the next due job for `worker_id`, or `None` if nothing is due.
    ///
    /// Also picks up active jobs whose lease lapsed and which still have
    /// attempts left. Each claim counts as one attempt.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<AnalysisJob>> {
        let job = sqlx::query_as::<_, AnalysisJob>(
            r#"
            WITH next AS (
                SELECT id FROM analysis_jobs
                WHERE (status = 'queued' AND run_at <= now())
                   OR (status = 'active' AND lease_expires_at < now()
                       AND attempts < max_attempts)
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE analysis_jobs j
            SET status = 'active',
                locked_by = $1,
                lease_expires_at = now() + make_interval(secs => $2),
                attempts = j.attempts + 1,
                updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .bind(self.config.lease_secs as f64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "Claimed analysis job"
            );
        }
        Ok(job)
    }

    /// Mark a claimed job done. Returns false if the lease was lost.
    pub async fn complete(&self, job: &AnalysisJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed', finished_at = now(), updated_at = now(),
                locked_by = NULL, lease_expires_at = NULL, last_error = NULL
            WHERE id = $1 AND status = 'active' AND locked_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job.id)
        .bind(&job.locked_by)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(job_id = %job.id, "Lease lost before completion; job left to its new owner");
            return Ok(false);
        }
        let _ = self.events.send(JobEvent::Completed {
            job_id: job.id,
            source_id: job.source_id,
        });
        Ok(true)
    }

    /// Record a failed delivery: reschedule with backoff, or dead-letter once
    /// attempts are exhausted.
    pub async fn fail(&self, job: &AnalysisJob, error: &str) -> Result<FailOutcome> {
        if job.is_final_attempt() {
            return self.dead_letter(job, error).await;
        }

        let backoff = self.config.backoff_for(job.attempts);
        let run_at = Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64);

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'queued', run_at = $3, last_error = $4, updated_at = now(),
                locked_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'active' AND locked_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job.id)
        .bind(&job.locked_by)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(FailOutcome::LeaseLost);
        }
        let _ = self.events.send(JobEvent::Failed {
            job_id: job.id,
            source_id: job.source_id,
            attempts: job.attempts,
            error: error.to_string(),
            dead: false,
        });
        Ok(FailOutcome::Retrying { run_at })
    }

    /// Put a claimed job back in the queue after `delay` without spending an
    /// attempt. Used when the job cannot run yet rather than having failed.
    /// Returns false if the lease was lost.
    pub async fn defer(&self, job: &AnalysisJob, delay: Duration, reason: &str) -> Result<bool> {
        let run_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'queued', run_at = $3, last_error = $4, updated_at = now(),
                attempts = GREATEST(attempts - 1, 0),
                locked_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'active' AND locked_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job.id)
        .bind(&job.locked_by)
        .bind(run_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        let deferred = result.rows_affected() > 0;
        if deferred {
            debug!(job_id = %job.id, %run_at, reason, "Analysis job deferred");
        }
        Ok(deferred)
    }

    /// Move a claimed job straight to the dead-letter state.
    pub async fn dead_letter(&self, job: &AnalysisJob, error: &str) -> Result<FailOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', last_error = $3, finished_at = now(), updated_at = now(),
                locked_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'active' AND locked_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job.id)
        .bind(&job.locked_by)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(FailOutcome::LeaseLost);
        }
        let _ = self.events.send(JobEvent::Failed {
            job_id: job.id,
            source_id: job.source_id,
            attempts: job.attempts,
            error: error.to_string(),
            dead: true,
        });
        Ok(FailOutcome::DeadLettered)
    }

    /// Dead-letter active jobs whose lease lapsed on their final attempt.
    /// Those would otherwise never be claimed again.
    pub async fn reap_expired(&self) -> Result<u64> {
        let reaped = sqlx::query_as::<_, AnalysisJob>(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                last_error = COALESCE(last_error || '; ', '') || 'lease expired on final attempt',
                finished_at = now(), updated_at = now(),
                locked_by = NULL, lease_expires_at = NULL
            WHERE status = 'active' AND lease_expires_at < now()
              AND attempts >= max_attempts
            RETURNING *
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for job in &reaped {
            warn!(
                job_id = %job.id,
                source_id = %job.source_id,
                "Dead-lettered job with expired lease"
            );
            let _ = self.events.send(JobEvent::Failed {
                job_id: job.id,
                source_id: job.source_id,
                attempts: job.attempts,
                error: job.last_error.clone().unwrap_or_default(),
                dead: true,
            });
        }
        Ok(reaped.len() as u64)
    }

    /// Most recently failed dead-letter jobs.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<AnalysisJob>> {
        sqlx::query_as::<_, AnalysisJob>(
            r#"
            SELECT * FROM analysis_jobs
            WHERE status = 'failed'
            ORDER BY finished_at DESC NULLS LAST
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    /// Returns false if the job is not dead-lettered.
    pub async fn retry_dead_letter(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'queued', attempts = 0, run_at = now(), finished_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("retry dead-lettered job {job_id}"))?;

        let retried = result.rows_affected() > 0;
        if retried {
            info!(%job_id, "Dead-lettered job re-queued");
        }
        Ok(retried)
    }

    /// Delete completed and dead-lettered jobs past their retention window.
    pub async fn purge_retained(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM analysis_jobs
            WHERE (status = 'completed' AND finished_at < now() - make_interval(hours => $1))
               OR (status = 'failed' AND finished_at < now() - make_interval(days => $2))
            "#,
        )
        .bind(self.config.retain_completed_hours as i32)
        .bind(self.config.retain_failed_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<AnalysisJob>> {
        sqlx::query_as::<_, AnalysisJob>("SELECT * FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM analysis_jobs WHERE status = $1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
