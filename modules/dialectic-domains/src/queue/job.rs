use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dialectic_core::SourceType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a worker needs to analyse one version of a post or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    /// Dead-lettered: attempts exhausted or the payload is unusable.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub source_type: String,
    pub source_id: Uuid,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn payload(&self) -> Result<JobPayload> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("job {} has an unreadable payload", self.id))
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Returned by enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    /// False when identical content was already queued or running and the
    /// existing job was returned.
    pub created: bool,
}

/// Where a failed delivery went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: DateTime<Utc> },
    DeadLettered,
    /// The lease had already passed to another worker; nothing changed.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed {
        job_id: Uuid,
        source_id: Uuid,
    },
    Failed {
        job_id: Uuid,
        source_id: Uuid,
        attempts: i32,
        error: String,
        dead: bool,
    },
}
