//! Semantic search over whole-content embeddings.

mod common;

use common::{basis, harness, DIM};
use dialectic_core::{SearchConfig, SourceType};
use dialectic_domains::search::{ContentEmbedding, DEFAULT_SEARCH_THRESHOLD};
use uuid::Uuid;

fn query(x: f32, y: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[0] = x;
    v[1] = y;
    v
}

#[tokio::test]
async fn threshold_filters_by_cosine_similarity() {
    let Some(h) = harness().await else { return };
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    ContentEmbedding::upsert(SourceType::Post, a, &basis(0), "ha", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Reply, b, &basis(2), "hb", h.pool()).await.unwrap();

    // cos(q, a) = 0.5, cos(q, b) = 0.
    let q = query(0.5, 0.866);
    let strict = ContentEmbedding::semantic_search(&q, 10, 0.9, h.pool()).await.unwrap();
    assert!(strict.is_empty());

    let loose = ContentEmbedding::semantic_search(&q, 10, 0.1, h.pool()).await.unwrap();
    assert_eq!(loose.len(), 1);
    assert_eq!(loose[0].source_id, a);
    assert!((loose[0].similarity - 0.5).abs() < 1e-3);
}

#[tokio::test]
async fn results_are_ordered_and_limited() {
    let Some(h) = harness().await else { return };
    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    ContentEmbedding::upsert(SourceType::Post, ids[0], &query(1.0, 0.0), "h0", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Post, ids[1], &query(1.0, 1.0), "h1", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Post, ids[2], &query(1.0, 3.0), "h2", h.pool()).await.unwrap();

    let hits = ContentEmbedding::semantic_search(&query(1.0, 0.0), 10, 0.0, h.pool())
        .await
        .unwrap();
    let order: Vec<Uuid> = hits.iter().map(|h| h.source_id).collect();
    assert_eq!(order, ids);
    assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));

    let top = ContentEmbedding::semantic_search(&query(1.0, 0.0), 1, 0.0, h.pool())
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].source_id, ids[0]);
}

#[tokio::test]
async fn default_threshold_drops_unrelated_content() {
    let Some(h) = harness().await else { return };
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    ContentEmbedding::upsert(SourceType::Post, a, &basis(0), "ha", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Post, b, &basis(1), "hb", h.pool()).await.unwrap();

    assert_eq!(DEFAULT_SEARCH_THRESHOLD, 0.5);
    let config = SearchConfig::default();
    let hits = ContentEmbedding::semantic_search_default(&basis(0), 10, &config, h.pool())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, a);
    assert_eq!(hits[0].source_type, "post");
}

#[tokio::test]
async fn configured_threshold_replaces_the_default() {
    let Some(h) = harness().await else { return };
    let (near, far) = (Uuid::new_v4(), Uuid::new_v4());
    let mut leaning = basis(0);
    leaning[1] = 1.0;
    ContentEmbedding::upsert(SourceType::Post, near, &basis(0), "hn", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Post, far, &leaning, "hf", h.pool()).await.unwrap();

    // cos(e0, e0 + e1) is about 0.707.
    let strict = SearchConfig {
        default_threshold: 0.9,
    };
    let hits = ContentEmbedding::semantic_search_default(&basis(0), 10, &strict, h.pool())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, near);

    let loose = SearchConfig {
        default_threshold: 0.6,
    };
    let hits = ContentEmbedding::semantic_search_default(&basis(0), 10, &loose, h.pool())
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn upsert_replaces_the_previous_embedding() {
    let Some(h) = harness().await else { return };
    let id = Uuid::new_v4();
    ContentEmbedding::upsert(SourceType::Post, id, &basis(0), "v1", h.pool()).await.unwrap();
    ContentEmbedding::upsert(SourceType::Post, id, &basis(1), "v2", h.pool()).await.unwrap();

    let stored = ContentEmbedding::find_for(SourceType::Post, id, h.pool())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.content_hash, "v2");
    assert_eq!(stored.embedding.to_vec(), basis(1));

    let hits = ContentEmbedding::semantic_search(&basis(0), 10, 0.5, h.pool()).await.unwrap();
    assert!(hits.is_empty());
}
