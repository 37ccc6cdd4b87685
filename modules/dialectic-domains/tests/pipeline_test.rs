//! End-to-end worker behaviour against Postgres with a fake engine.

mod common;

use common::{count, harness, payload};
use dialectic_core::{PipelineError, RunStatus, SourceType};
use dialectic_domains::analysis::models::{Adu, AduEmbedding, AnalysisRun, ArgumentRelation};
use dialectic_domains::claims::models::{CanonicalClaim, CanonicalMapping};
use dialectic_domains::content::ContentItem;
use dialectic_domains::search::ContentEmbedding;
use dialectic_domains::{Outcome, RunSummary};
use uuid::Uuid;

const TEXT: &str = "Taxes are too high. Because rent doubled.";

#[tokio::test]
async fn analysis_writes_adus_claims_relations_and_content_embedding() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;

    let outcome = h.worker.process(&job).await.unwrap();
    let Outcome::Completed { run_id, summary } = outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(
        summary,
        RunSummary {
            adus: 2,
            claims: 1,
            canonical_created: 1,
            canonical_linked: 0,
            relations: 1,
        }
    );

    let run = AnalysisRun::find_by_id(run_id, h.pool()).await.unwrap().unwrap();
    assert_eq!(run.run_status().unwrap(), RunStatus::Completed);
    assert!(run.completed_at.is_some());

    let adus = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();
    assert_eq!(adus.len(), 2);
    assert!(adus.iter().all(|a| a.analysis_run_id == run_id));
    assert_eq!(adus[0].text, "Taxes are too high.");
    assert_eq!(adus[1].adu_type, "premise");
    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM adu_embeddings").await, 2);

    let relations = ArgumentRelation::find_for_adus(&[adus[0].id], h.pool()).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].source_adu_id, adus[1].id);
    assert_eq!(relations[0].target_adu_id, adus[0].id);
    assert_eq!(relations[0].relation_type, "support");

    let mapping = CanonicalMapping::find_for_adu(adus[0].id, h.pool()).await.unwrap().unwrap();
    let claim = CanonicalClaim::find_by_id(mapping.canonical_claim_id, h.pool())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.adu_count, 1);
    assert_eq!(claim.discussion_count, 1);
    assert_eq!(claim.author_id, post.author_id);
    assert!(CanonicalMapping::find_for_adu(adus[1].id, h.pool()).await.unwrap().is_none());

    let embedding = ContentEmbedding::find_for(SourceType::Post, post.id, h.pool())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(embedding.content_hash, run.content_hash);

    let item = ContentItem::find(SourceType::Post, post.id, h.pool()).await.unwrap().unwrap();
    assert_eq!(item.analysis_status, "completed");
}

#[tokio::test]
async fn unchanged_content_is_not_analysed_twice() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;

    let first = h.worker.process(&job).await.unwrap();
    let Outcome::Completed { run_id: first_run, .. } = first else {
        panic!("expected completed, got {first:?}");
    };
    let adus_before = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();

    let second = h.worker.process(&job).await.unwrap();
    let Outcome::Unchanged { run_id, completed_run_id } = second else {
        panic!("expected unchanged, got {second:?}");
    };
    assert_eq!(completed_run_id, first_run);
    assert_eq!(run_id, None);
    assert_eq!(h.engine.analyze_calls(), 1);

    // A duplicate delivery opens no run of its own.
    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, first_run);

    let adus_after = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();
    let ids = |adus: &[Adu]| adus.iter().map(|a| a.id).collect::<Vec<Uuid>>();
    assert_eq!(ids(&adus_before), ids(&adus_after));
}

#[tokio::test]
async fn edit_reverted_before_analysis_closes_the_pending_run() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;
    let Outcome::Completed { run_id: first_run, .. } = h.worker.process(&job).await.unwrap()
    else {
        panic!("expected completed");
    };

    ContentItem::update_content(SourceType::Post, post.id, "Something else.", &h.queue, h.pool())
        .await
        .unwrap();
    ContentItem::update_content(SourceType::Post, post.id, TEXT, &h.queue, h.pool())
        .await
        .unwrap();

    let outcome = h.worker.process(&job).await.unwrap();
    let Outcome::Unchanged { run_id: Some(run_id), completed_run_id } = outcome else {
        panic!("expected unchanged with a closed run, got {outcome:?}");
    };
    assert_eq!(completed_run_id, first_run);
    assert_eq!(h.engine.analyze_calls(), 1);

    let closed = AnalysisRun::find_by_id(run_id, h.pool()).await.unwrap().unwrap();
    assert_eq!(closed.status, "completed");
    assert_eq!(
        closed.error_message.as_deref(),
        Some(dialectic_domains::analysis::UNCHANGED_NOTE)
    );
    assert_eq!(
        AnalysisRun::count_by_status(RunStatus::Pending, h.pool()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn unchanged_content_waits_for_a_run_processing_other_content() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;
    h.worker.process(&job).await.unwrap();

    // Another worker is mid-way through an edit that has since been reverted.
    ContentItem::update_content(SourceType::Post, post.id, "Interim text.", &h.queue, h.pool())
        .await
        .unwrap();
    let interim = AnalysisRun::find_active(SourceType::Post, post.id, h.pool())
        .await
        .unwrap()
        .unwrap();
    AnalysisRun::mark_processing(interim.id, h.pool()).await.unwrap();
    ContentItem::update_content(SourceType::Post, post.id, TEXT, &h.queue, h.pool())
        .await
        .unwrap();

    let err = h.worker.process(&job).await.unwrap_err();
    assert!(matches!(err, PipelineError::InProgress(id) if id == interim.id));
}

#[tokio::test]
async fn edited_content_replaces_adus_and_refreshes_counters() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post("Rent control reduces supply.").await;
    h.worker.process(&job).await.unwrap();

    let old = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();
    let old_claim = CanonicalMapping::find_for_adu(old[0].id, h.pool())
        .await
        .unwrap()
        .unwrap()
        .canonical_claim_id;

    let edited = "Zoning reform increases supply.";
    let handle = ContentItem::update_content(SourceType::Post, post.id, edited, &h.queue, h.pool())
        .await
        .unwrap();
    assert!(handle.is_some());

    let outcome = h
        .worker
        .process(&payload(SourceType::Post, post.id, edited))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));

    let new = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();
    assert_eq!(new.len(), 1);
    assert_eq!(new[0].text, edited);
    assert!(old.iter().all(|o| new.iter().all(|n| n.id != o.id)));

    // The old canonical claim survives with nothing mapped to it.
    let claim = CanonicalClaim::find_by_id(old_claim, h.pool()).await.unwrap().unwrap();
    assert_eq!(claim.adu_count, 0);
    assert_eq!(claim.discussion_count, 0);
    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM canonical_claims").await, 2);
}

#[tokio::test]
async fn identical_edit_enqueues_nothing() {
    let Some(h) = harness().await else { return };
    let (post, _) = h.post(TEXT).await;

    let handle = ContentItem::update_content(SourceType::Post, post.id, TEXT, &h.queue, h.pool())
        .await
        .unwrap();
    assert!(handle.is_none());
    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM analysis_jobs").await, 1);
}

#[tokio::test]
async fn job_for_replaced_content_is_superseded() {
    let Some(h) = harness().await else { return };
    let (post, stale) = h.post("First draft claim.").await;
    ContentItem::update_content(SourceType::Post, post.id, "Final claim.", &h.queue, h.pool())
        .await
        .unwrap();

    assert_eq!(h.worker.process(&stale).await.unwrap(), Outcome::Superseded);
    assert_eq!(h.engine.analyze_calls(), 0);

    let fresh = payload(SourceType::Post, post.id, "Final claim.");
    assert!(matches!(
        h.worker.process(&fresh).await.unwrap(),
        Outcome::Completed { .. }
    ));
    // The pending run opened at submission was reused for the edit.
    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "completed");
}

#[tokio::test]
async fn engine_outage_fails_the_run_and_a_retry_gets_a_new_run() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;

    h.engine.set_fail_analyze(true);
    let err = h.worker.process(&job).await.unwrap_err();
    assert!(matches!(err, PipelineError::Transient(_)));
    assert!(err.is_transient());

    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("discourse engine unavailable"));
    assert!(Adu::find_by_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap()
        .is_empty());
    let item = ContentItem::find(SourceType::Post, post.id, h.pool()).await.unwrap().unwrap();
    assert_eq!(item.analysis_status, "failed");

    h.engine.set_fail_analyze(false);
    assert!(matches!(
        h.worker.process(&job).await.unwrap(),
        Outcome::Completed { .. }
    ));
    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, "completed");
    assert_eq!(runs[1].status, "failed");
}

#[tokio::test]
async fn wrong_embedding_width_fails_without_writing() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;
    h.engine.set_returned_dimension(512);

    let err = h.worker.process(&job).await.unwrap_err();
    assert!(matches!(err, PipelineError::Malformed(_)));
    assert!(err.to_string().contains("expected 768, got 512"));

    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM adus").await, 0);
    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs[0].status, "failed");
}

#[tokio::test]
async fn deleted_content_is_dropped() {
    let Some(h) = harness().await else { return };
    let (post, job) = h.post(TEXT).await;
    assert!(ContentItem::soft_delete(SourceType::Post, post.id, h.pool()).await.unwrap());

    assert_eq!(h.worker.process(&job).await.unwrap(), Outcome::SourceMissing);
    let runs = AnalysisRun::find_for_source(SourceType::Post, post.id, h.pool())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
    assert_eq!(h.engine.analyze_calls(), 0);
}

#[tokio::test]
async fn replies_are_analysed_under_their_own_source() {
    let Some(h) = harness().await else { return };
    let (post, _) = h.post("Transit should be free.").await;
    let reply_text = "Transit should be free. Because cars pollute.";
    let (reply, _) =
        ContentItem::submit_reply(post.id, None, reply_text, &h.queue, h.pool())
            .await
            .unwrap();
    assert_eq!(reply.source_type, "reply");

    h.worker
        .process(&payload(SourceType::Post, post.id, "Transit should be free."))
        .await
        .unwrap();
    let outcome = h
        .worker
        .process(&payload(SourceType::Reply, reply.id, reply_text))
        .await
        .unwrap();
    let Outcome::Completed { summary, .. } = outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    // Same claim text in the post and the reply: one canonical claim, two discussions.
    assert_eq!(summary.canonical_linked, 1);

    let adus = Adu::find_by_source(SourceType::Reply, reply.id, h.pool()).await.unwrap();
    assert!(adus.iter().all(|a| a.source_type == "reply"));
    let mapping = CanonicalMapping::find_for_adu(adus[0].id, h.pool()).await.unwrap().unwrap();
    let claim = CanonicalClaim::find_by_id(mapping.canonical_claim_id, h.pool())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.adu_count, 2);
    assert_eq!(claim.discussion_count, 2);
}

#[tokio::test]
async fn empty_batches_are_no_ops() {
    let Some(h) = harness().await else { return };
    assert_eq!(AduEmbedding::create_batch(&[], h.pool()).await.unwrap(), 0);
    assert_eq!(ArgumentRelation::create_batch(&[], h.pool()).await.unwrap(), 0);
    assert!(CanonicalMapping::for_adus(&[], h.pool()).await.unwrap().is_empty());

    // One ADU: nothing to relate, and the run still completes.
    let (post, job) = h.post("Transit should be free.").await;
    let Outcome::Completed { summary, .. } = h.worker.process(&job).await.unwrap() else {
        panic!("expected completed");
    };
    assert_eq!(summary.adus, 1);
    assert_eq!(summary.relations, 0);
    assert_eq!(count(h.pool(), "SELECT COUNT(*) FROM argument_relations").await, 0);

    let adus = Adu::find_by_source(SourceType::Post, post.id, h.pool()).await.unwrap();
    let ids: Vec<Uuid> = adus.iter().map(|a| a.id).collect();
    assert_eq!(CanonicalMapping::for_adus(&ids, h.pool()).await.unwrap().len(), 1);
}
