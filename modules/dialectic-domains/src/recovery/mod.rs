//! Startup reconciliation of runs orphaned in `processing` by a dead worker.

use anyhow::Result;
use dialectic_core::{reconcile, RunStatus, SourceType};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::models::{Adu, AnalysisRun};
use crate::content::{ContentItem, ContentSource};
use crate::queue::JobQueue;

/// Advisory lock key serialising recovery across worker processes.
pub const RECOVERY_LOCK_KEY: i64 = 0x6469_616c_6563_7431;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphans that had artifacts and were closed as completed.
    pub completed: Vec<Uuid>,
    /// Orphans with nothing written, returned to pending.
    pub reset: Vec<Uuid>,
    /// Reset runs whose content was queued again.
    pub requeued: usize,
    /// Reset runs left pending because their content could not be read back
    /// or queued.
    pub skipped: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.reset.is_empty()
    }
}

/// Reconcile every `processing` run, then re-queue the ones reset to pending.
///
/// The status changes commit in one transaction under an advisory lock, so
/// two workers starting together do not both act on the same orphan.
/// Re-queueing happens after commit and revives any in-flight job for the
/// same content. A run that cannot be re-queued is logged and counted as
/// skipped; the rest still go out.
pub async fn recover_orphaned_runs(
    pool: &PgPool,
    queue: &JobQueue,
    content: &dyn ContentSource,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut to_requeue: Vec<(SourceType, Uuid)> = Vec::new();

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(RECOVERY_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let orphans = AnalysisRun::lock_processing(&mut *tx).await?;
    for run in &orphans {
        let source_type = run.source()?;
        let has_artifacts = Adu::exists_for_run(run.id, &mut *tx).await?;
        let reconciliation = reconcile(RunStatus::Processing, has_artifacts);
        AnalysisRun::apply_reconciliation(run.id, &reconciliation, &mut *tx).await?;
        ContentItem::set_analysis_status(
            source_type,
            run.source_id,
            reconciliation.status,
            &mut *tx,
        )
        .await?;

        match reconciliation.status {
            RunStatus::Completed => report.completed.push(run.id),
            RunStatus::Pending => {
                report.reset.push(run.id);
                to_requeue.push((source_type, run.source_id));
            }
            _ => {}
        }
    }
    tx.commit().await?;

    for (source_type, source_id) in to_requeue {
        let item = match content.fetch(source_type, source_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(%source_type, %source_id, "Content missing for reset run; left pending");
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(
                    %source_type,
                    %source_id,
                    error = %e,
                    "Failed to read content for reset run; left pending"
                );
                report.skipped += 1;
                continue;
            }
        };
        match queue.requeue(source_type, source_id, &item.content).await {
            Ok(_) => report.requeued += 1,
            Err(e) => {
                warn!(%source_type, %source_id, error = %e, "Failed to requeue reset run");
                report.skipped += 1;
            }
        }
    }

    if report.is_empty() {
        info!("Recovery found no orphaned runs");
    } else {
        info!(
            completed = report.completed.len(),
            reset = report.reset.len(),
            requeued = report.requeued,
            skipped = report.skipped,
            "Recovered orphaned analysis runs"
        );
    }
    Ok(report)
}
