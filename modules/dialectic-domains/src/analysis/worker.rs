//! Drives one analysis job end to end.
//!
//! ```text
//! job ─► stale? ─► unchanged? ─► active run ─► processing
//!                                                  │
//!     extract ─► embed ─► replace ADUs ─► dedup claims ─► relations ─► content embedding
//!                                                  │
//!                                       completed | failed
//! ```

use std::sync::Arc;

use dialectic_core::{content_hash, PipelineError, RunStatus, WorkerDeps};
use discourse_client::{check_embeddings, TextItem};
use tracing::{info, warn};
use uuid::Uuid;

use super::activities::extract::{map_relations, validate_adus};
use super::models::{Adu, AnalysisRun, ArgumentRelation, NewAdu, RunSlot};
use crate::claims::activities::ClaimDeduplicator;
use crate::content::{ContentItem, ContentSource};
use crate::queue::JobPayload;
use crate::search::ContentEmbedding;

/// Note stored on a run that found its content already analysed.
pub const UNCHANGED_NOTE: &str = "skipped: content unchanged";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub adus: usize,
    pub claims: usize,
    pub canonical_created: usize,
    pub canonical_linked: usize,
    pub relations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { run_id: Uuid, summary: RunSummary },
    /// A completed run already covers this exact content. `run_id` is the
    /// pending run closed as a no-op, if one was waiting.
    Unchanged {
        run_id: Option<Uuid>,
        completed_run_id: Uuid,
    },
    /// The content was edited since the job was queued; a newer job covers it.
    Superseded,
    /// The content no longer exists.
    SourceMissing,
}

pub struct AnalysisWorker {
    deps: Arc<WorkerDeps>,
    content: Arc<dyn ContentSource>,
    dedup: ClaimDeduplicator,
}

impl AnalysisWorker {
    pub fn new(deps: Arc<WorkerDeps>, content: Arc<dyn ContentSource>) -> Self {
        let dedup = ClaimDeduplicator::new(deps.clone());
        Self {
            deps,
            content,
            dedup,
        }
    }

    pub async fn process(&self, job: &JobPayload) -> Result<Outcome, PipelineError> {
        let pool = self.deps.pool();
        let (source_type, source_id) = (job.source_type, job.source_id);
        let hash = content_hash(&job.content);

        let Some(item) = self.content.fetch(source_type, source_id).await? else {
            warn!(%source_type, %source_id, "Content gone, dropping analysis job");
            AnalysisRun::fail_pending_for_source(
                source_type,
                source_id,
                "source content no longer exists",
                pool,
            )
            .await?;
            return Ok(Outcome::SourceMissing);
        };
        if item.content_hash != hash {
            info!(%source_type, %source_id, "Content edited since enqueue, skipping stale job");
            return Ok(Outcome::Superseded);
        }

        // A run still processing other content may yet complete over this
        // version; wait for it before deciding anything.
        if let Some(active) = AnalysisRun::find_active(source_type, source_id, pool).await? {
            if active.status == RunStatus::Processing.as_str() && active.content_hash != hash {
                return Err(PipelineError::InProgress(active.id));
            }
        }

        // Checked before touching runs so a duplicate delivery writes nothing
        // beyond closing a pending run left for this same content.
        if let Some(done) = AnalysisRun::latest_completed(source_type, source_id, pool).await? {
            if done.content_hash == hash {
                let closed = AnalysisRun::close_pending_for_hash(
                    source_type,
                    source_id,
                    &hash,
                    UNCHANGED_NOTE,
                    pool,
                )
                .await?;
                ContentItem::set_analysis_status(source_type, source_id, RunStatus::Completed, pool)
                    .await?;
                let run_id = closed.map(|run| run.id);
                info!(
                    run_id = ?run_id,
                    completed_run_id = %done.id,
                    "Content unchanged, skipping analysis"
                );
                return Ok(Outcome::Unchanged {
                    run_id,
                    completed_run_id: done.id,
                });
            }
        }

        let run = match AnalysisRun::find_or_create_active(source_type, source_id, &hash, pool)
            .await?
        {
            RunSlot::Ready(run) => run,
            RunSlot::Busy(other) => return Err(PipelineError::InProgress(other.id)),
        };

        let run = AnalysisRun::mark_processing(run.id, pool).await?;
        ContentItem::set_analysis_status(source_type, source_id, RunStatus::Processing, pool)
            .await?;
        info!(run_id = %run.id, %source_type, %source_id, "Analysis started");

        let timeout = self.deps.file_config.worker.job_timeout();
        let result = match tokio::time::timeout(timeout, self.analyse(&run, &item, job)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(summary) => {
                AnalysisRun::mark_completed(run.id, None, pool).await?;
                ContentItem::set_analysis_status(source_type, source_id, RunStatus::Completed, pool)
                    .await?;
                info!(
                    run_id = %run.id,
                    adus = summary.adus,
                    claims = summary.claims,
                    canonical_created = summary.canonical_created,
                    canonical_linked = summary.canonical_linked,
                    relations = summary.relations,
                    "Analysis completed"
                );
                Ok(Outcome::Completed {
                    run_id: run.id,
                    summary,
                })
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = AnalysisRun::mark_failed(run.id, &message, pool).await {
                    warn!(run_id = %run.id, error = %e, "Failed to record run failure");
                }
                let mirrored =
                    ContentItem::set_analysis_status(source_type, source_id, RunStatus::Failed, pool)
                        .await;
                if let Err(e) = mirrored {
                    warn!(run_id = %run.id, error = %e, "Failed to mirror failure onto content");
                }
                warn!(
                    run_id = %run.id,
                    error = %message,
                    transient = err.is_transient(),
                    "Analysis failed"
                );
                Err(err)
            }
        }
    }

    async fn analyse(
        &self,
        run: &AnalysisRun,
        item: &ContentItem,
        job: &JobPayload,
    ) -> Result<RunSummary, PipelineError> {
        let engine = &self.deps.engine;
        let pool = self.deps.pool();
        let dimension = self.deps.file_config.engine.embedding_dimension;

        let extracted = engine
            .analyze_adus(&[TextItem::new(job.source_id.to_string(), job.content.as_str())])
            .await?;
        let valid = validate_adus(&extracted, &job.content)?;

        // ADU texts plus the whole content, embedded in one call.
        let mut texts: Vec<String> = valid.iter().map(|a| a.text.clone()).collect();
        texts.push(job.content.clone());
        let mut embeddings = engine.embed_content(&texts).await?;
        check_embeddings(&embeddings, texts.len(), dimension)?;
        let content_embedding = embeddings
            .pop()
            .ok_or_else(|| PipelineError::Malformed("missing content embedding".into()))?;

        let new_adus: Vec<NewAdu> = valid
            .into_iter()
            .zip(embeddings)
            .map(|(adu, embedding)| NewAdu {
                adu_type: adu.adu_type,
                text: adu.text,
                span_start: adu.span_start,
                span_end: adu.span_end,
                confidence: adu.confidence,
                embedding,
            })
            .collect();

        let adus = Adu::replace_for_source(run, &new_adus, pool).await?;

        let mut summary = RunSummary {
            adus: adus.len(),
            ..Default::default()
        };
        for (adu, new) in adus.iter().zip(&new_adus) {
            if !adu.is_claim() {
                continue;
            }
            summary.claims += 1;
            let outcome = self
                .dedup
                .resolve(adu, &new.embedding, item.author_id)
                .await?;
            if outcome.created {
                summary.canonical_created += 1;
            } else {
                summary.canonical_linked += 1;
            }
        }

        if adus.len() >= 2 {
            let items: Vec<TextItem> = adus
                .iter()
                .map(|a| TextItem::new(a.id.to_string(), a.text.as_str()))
                .collect();
            let detected = engine.detect_relations(&items).await?;
            let relations = map_relations(&detected, &adus)?;
            ArgumentRelation::create_batch(&relations, pool).await?;
            summary.relations = relations.len();
        }

        ContentEmbedding::upsert(
            job.source_type,
            job.source_id,
            &content_embedding,
            &run.content_hash,
            pool,
        )
        .await?;

        Ok(summary)
    }
}
