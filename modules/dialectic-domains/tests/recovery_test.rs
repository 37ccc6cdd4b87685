//! Startup reconciliation of runs a crashed worker left in `processing`.

mod common;

use anyhow::anyhow;
use async_trait::async_trait;
use common::{count, harness, harness_with};
use dialectic_core::{FileConfig, RunStatus, SourceType, RECOVERED_NOTE, RESET_NOTE};
use dialectic_domains::analysis::models::AnalysisRun;
use dialectic_domains::content::ContentItem;
use dialectic_domains::queue::JobStatus;
use dialectic_domains::{recover_orphaned_runs, ContentSource, PgContentSource};
use uuid::Uuid;

/// Reads through to Postgres except for one source, which errors.
struct FlakyContent {
    inner: PgContentSource,
    broken: Uuid,
}

#[async_trait]
impl ContentSource for FlakyContent {
    async fn fetch(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> anyhow::Result<Option<ContentItem>> {
        if source_id == self.broken {
            return Err(anyhow!("connection reset"));
        }
        self.inner.fetch(source_type, source_id).await
    }
}

async fn force_processing(pool: &sqlx::PgPool, run_id: Uuid) {
    sqlx::query("UPDATE analysis_runs SET status = 'processing', completed_at = NULL WHERE id = $1")
        .bind(run_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn only_run(h: &common::Harness, source_id: Uuid) -> AnalysisRun {
    let runs = AnalysisRun::find_for_source(SourceType::Post, source_id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    runs.into_iter().next().unwrap()
}

#[tokio::test]
async fn orphans_are_completed_or_reset_by_artifacts() {
    let Some(h) = harness().await else { return };
    let content = PgContentSource::new(h.pool().clone());

    // Crashed after writing ADUs.
    let (with_adus, job) = h.post("Wages lag inflation.").await;
    h.worker.process(&job).await.unwrap();
    let run_a = only_run(&h, with_adus.id).await;
    force_processing(h.pool(), run_a.id).await;

    // Crashed before writing anything.
    let (bare, _) = h.post("Parks reduce crime.").await;
    let run_b = only_run(&h, bare.id).await;
    force_processing(h.pool(), run_b.id).await;

    // Crashed, and the content was deleted since.
    let (gone, _) = h.post("Deleted thought.").await;
    let run_c = only_run(&h, gone.id).await;
    force_processing(h.pool(), run_c.id).await;
    ContentItem::soft_delete(SourceType::Post, gone.id, h.pool()).await.unwrap();

    // Untouched: an ordinary pending run.
    let (waiting, _) = h.post("Still pending.").await;

    let report = recover_orphaned_runs(h.pool(), &h.queue, &content).await.unwrap();
    assert_eq!(report.completed, vec![run_a.id]);
    assert_eq!(report.reset.len(), 2);
    assert!(report.reset.contains(&run_b.id) && report.reset.contains(&run_c.id));
    assert_eq!(report.requeued, 1);
    assert_eq!(report.skipped, 1);

    let a = AnalysisRun::find_by_id(run_a.id, h.pool()).await.unwrap().unwrap();
    assert_eq!(a.run_status().unwrap(), RunStatus::Completed);
    assert_eq!(a.error_message.as_deref(), Some(RECOVERED_NOTE));
    assert!(a.completed_at.is_some());

    let b = AnalysisRun::find_by_id(run_b.id, h.pool()).await.unwrap().unwrap();
    assert_eq!(b.run_status().unwrap(), RunStatus::Pending);
    assert_eq!(b.error_message.as_deref(), Some(RESET_NOTE));

    let c = AnalysisRun::find_by_id(run_c.id, h.pool()).await.unwrap().unwrap();
    assert_eq!(c.run_status().unwrap(), RunStatus::Pending);

    assert_eq!(only_run(&h, waiting.id).await.status, "pending");
    assert_eq!(
        AnalysisRun::count_by_status(RunStatus::Processing, h.pool()).await.unwrap(),
        0
    );

    // Jobs queued at submission are still in flight, so re-queueing revives them.
    assert_eq!(h.queue.count_by_status(JobStatus::Queued).await.unwrap(), 4);

    // Reset run is picked up by the next attempt.
    let job = dialectic_domains::queue::JobPayload {
        source_type: SourceType::Post,
        source_id: bare.id,
        content: "Parks reduce crime.".into(),
    };
    h.worker.process(&job).await.unwrap();
    assert_eq!(only_run(&h, bare.id).await.status, "completed");
}

#[tokio::test]
async fn recovery_is_a_no_op_when_nothing_is_orphaned() {
    let Some(h) = harness().await else { return };
    let content = PgContentSource::new(h.pool().clone());
    let (_, job) = h.post("Nothing to recover.").await;
    h.worker.process(&job).await.unwrap();

    let report = recover_orphaned_runs(h.pool(), &h.queue, &content).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.requeued, 0);
}

#[tokio::test]
async fn concurrent_recoveries_handle_each_orphan_once() {
    let Some(h) = harness().await else { return };
    let content = PgContentSource::new(h.pool().clone());

    let mut orphans = Vec::new();
    for text in ["One.", "Two.", "Three."] {
        let (post, _) = h.post(text).await;
        let run = only_run(&h, post.id).await;
        force_processing(h.pool(), run.id).await;
        orphans.push(run.id);
    }
    sqlx::query("DELETE FROM analysis_jobs").execute(h.pool()).await.unwrap();

    let (r1, r2) = tokio::join!(
        recover_orphaned_runs(h.pool(), &h.queue, &content),
        recover_orphaned_runs(h.pool(), &h.queue, &content),
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());
    assert_eq!(r1.reset.len() + r2.reset.len(), orphans.len());
    assert_eq!(r1.requeued + r2.requeued, orphans.len());
    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM analysis_jobs").await, 3);
}

#[tokio::test]
async fn reset_run_revives_a_job_stuck_on_its_final_attempt() {
    let mut config = FileConfig::default();
    config.queue.max_attempts = 1;
    let Some(h) = harness_with(config).await else { return };
    let content = PgContentSource::new(h.pool().clone());

    // The worker claimed its last attempt, opened the run, then died.
    let (post, _) = h.post("Crashed on the last try.").await;
    let stuck = h.queue.claim_next("dead-worker").await.unwrap().unwrap();
    assert!(stuck.is_final_attempt());
    let run = only_run(&h, post.id).await;
    force_processing(h.pool(), run.id).await;

    let report = recover_orphaned_runs(h.pool(), &h.queue, &content).await.unwrap();
    assert_eq!(report.reset, vec![run.id]);
    assert_eq!(report.requeued, 1);

    let job = h.queue.find_by_id(stuck.id).await.unwrap().unwrap();
    assert_eq!(job.status, "queued");
    assert_eq!(job.attempts, 0);
    assert!(job.locked_by.is_none());

    let job = h.queue.claim_next("w2").await.unwrap().unwrap();
    assert_eq!(job.id, stuck.id);
    h.worker.process(&job.payload().unwrap()).await.unwrap();
    assert!(h.queue.complete(&job).await.unwrap());
    assert_eq!(only_run(&h, post.id).await.status, "completed");
}

#[tokio::test]
async fn one_unreadable_source_does_not_strand_the_others() {
    let Some(h) = harness().await else { return };

    let mut posts = Vec::new();
    for text in ["First orphan.", "Second orphan.", "Third orphan."] {
        let (post, _) = h.post(text).await;
        let run = only_run(&h, post.id).await;
        force_processing(h.pool(), run.id).await;
        posts.push(post.id);
    }
    sqlx::query("DELETE FROM analysis_jobs").execute(h.pool()).await.unwrap();

    let content = FlakyContent {
        inner: PgContentSource::new(h.pool().clone()),
        broken: posts[0],
    };
    let report = recover_orphaned_runs(h.pool(), &h.queue, &content).await.unwrap();
    assert_eq!(report.reset.len(), 3);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.skipped, 1);

    let queued: Vec<(Uuid,)> = sqlx::query_as("SELECT source_id FROM analysis_jobs")
        .fetch_all(h.pool())
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|(id,)| *id != posts[0]));
}
