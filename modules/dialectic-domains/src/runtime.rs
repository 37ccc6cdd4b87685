use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dialectic_core::{PipelineError, WorkerDeps};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisWorker, Outcome};
use crate::content::ContentSource;
use crate::queue::{AnalysisJob, FailOutcome, JobEvent, JobQueue};
use crate::recovery::{recover_orphaned_runs, RecoveryReport};

/// Long-running worker: recovery at start, then a poll loop pulling jobs with
/// bounded concurrency, plus periodic queue maintenance.
pub struct WorkerRuntime {
    deps: Arc<WorkerDeps>,
    queue: JobQueue,
    content: Arc<dyn ContentSource>,
    worker: Arc<AnalysisWorker>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn new(deps: Arc<WorkerDeps>, content: Arc<dyn ContentSource>) -> Self {
        let queue = JobQueue::new(deps.db_pool.clone(), deps.file_config.queue.clone());
        let worker = Arc::new(AnalysisWorker::new(deps.clone(), content.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            deps,
            queue,
            content,
            worker,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Reconcile orphaned runs, then start polling. Recovery finishes before
    /// the first job is claimed.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        if !self.tasks.is_empty() {
            return Err(anyhow!("worker runtime already started"));
        }

        let report =
            recover_orphaned_runs(self.deps.pool(), &self.queue, self.content.as_ref()).await?;

        self.tasks.push(tokio::spawn(log_job_events(
            self.queue.subscribe(),
            self.shutdown_tx.subscribe(),
        )));
        self.tasks.push(tokio::spawn(poll_loop(
            self.deps.clone(),
            self.queue.clone(),
            self.worker.clone(),
            self.shutdown_tx.subscribe(),
        )));

        info!(
            worker_id = self.deps.config.worker_id.as_str(),
            concurrency = self.deps.file_config.worker.concurrency,
            "Worker runtime started"
        );
        Ok(report)
    }

    /// Stop claiming, let in-flight jobs finish within the grace period, and
    /// return once every background task has exited.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Worker runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker runtime stopped");
        Ok(())
    }
}

async fn poll_loop(
    deps: Arc<WorkerDeps>,
    queue: JobQueue,
    worker: Arc<AnalysisWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let settings = deps.file_config.worker.clone();
    let worker_id = deps.config.worker_id.clone();
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let mut in_flight = JoinSet::new();
    let mut maintenance = tokio::time::interval(Duration::from_secs(
        settings.maintenance_interval_secs.max(1),
    ));

    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Some(done) = in_flight.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "Job task panicked");
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = maintenance.tick() => run_maintenance(&queue).await,
            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                match queue.claim_next(&worker_id).await {
                    Ok(Some(job)) => {
                        let queue = queue.clone();
                        let worker = worker.clone();
                        in_flight.spawn(async move {
                            handle_job(&queue, &worker, job).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(settings.poll_interval()) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!(error = %e, "Failed to claim job");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(settings.poll_interval()) => {}
                        }
                    }
                }
            }
        }
    }

    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    let pending = in_flight.len();
    if pending > 0 {
        info!(in_flight = pending, "Waiting for in-flight jobs");
    }
    let drained = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        // Their runs stay in processing; recovery picks them up on restart.
        warn!(
            abandoned = in_flight.len(),
            "Shutdown grace period elapsed, abandoning jobs"
        );
        in_flight.abort_all();
    }
}

/// Run one claimed job through the worker and settle it on the queue.
pub async fn handle_job(queue: &JobQueue, worker: &AnalysisWorker, job: AnalysisJob) {
    let payload = match job.payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Unreadable job payload, dead-lettering");
            if let Err(e) = queue.dead_letter(&job, &e.to_string()).await {
                error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
            }
            return;
        }
    };

    match worker.process(&payload).await {
        Ok(outcome) => {
            match &outcome {
                Outcome::Completed { run_id, .. } => {
                    debug!(job_id = %job.id, %run_id, "Job analysed")
                }
                Outcome::Unchanged {
                    completed_run_id, ..
                } => {
                    debug!(job_id = %job.id, %completed_run_id, "Job skipped, content unchanged")
                }
                Outcome::Superseded | Outcome::SourceMissing => {
                    debug!(job_id = %job.id, ?outcome, "Job dropped")
                }
            }
            if let Err(e) = queue.complete(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to complete job");
            }
        }
        // Another attempt holds the source; wait for it without spending an attempt.
        Err(PipelineError::InProgress(run_id)) => {
            let delay = Duration::from_millis(queue.config().backoff_base_ms);
            let reason = PipelineError::InProgress(run_id).to_string();
            match queue.defer(&job, delay, &reason).await {
                Ok(true) => info!(
                    job_id = %job.id,
                    busy_run_id = %run_id,
                    delay_ms = delay.as_millis() as u64,
                    "Source busy, job deferred"
                ),
                Ok(false) => {
                    warn!(job_id = %job.id, "Lease lost before job could be deferred")
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to defer job"),
            }
        }
        Err(err) => match queue.fail(&job, &err.to_string()).await {
            Ok(FailOutcome::Retrying { run_at }) => info!(
                job_id = %job.id,
                attempt = job.attempts,
                %run_at,
                "Job scheduled for retry"
            ),
            Ok(FailOutcome::DeadLettered) => error!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %err,
                "Job dead-lettered"
            ),
            Ok(FailOutcome::LeaseLost) => {
                warn!(job_id = %job.id, "Lease lost before failure could be recorded")
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
        },
    }
}

async fn run_maintenance(queue: &JobQueue) {
    match queue.reap_expired().await {
        Ok(0) => {}
        Ok(n) => warn!(reaped = n, "Dead-lettered jobs with expired final leases"),
        Err(e) => warn!(error = %e, "Failed to reap expired jobs"),
    }
    match queue.purge_retained().await {
        Ok(0) => {}
        Ok(n) => info!(purged = n, "Purged finished jobs past retention"),
        Err(e) => warn!(error = %e, "Failed to purge finished jobs"),
    }
}

async fn log_job_events(
    mut events: broadcast::Receiver<JobEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(JobEvent::Completed { job_id, source_id }) => {
                    info!(%job_id, %source_id, "Job completed")
                }
                Ok(JobEvent::Failed { job_id, source_id, attempts, error, dead }) => warn!(
                    %job_id,
                    %source_id,
                    attempts,
                    dead,
                    error = error.as_str(),
                    "Job failed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Job event log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
