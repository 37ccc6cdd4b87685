use anyhow::Result;
use chrono::{DateTime, Utc};
use dialectic_core::{SearchConfig, SourceType};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Whole-content embedding of a post or reply, one row per source.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContentEmbedding {
    pub source_type: String,
    pub source_id: Uuid,
    pub embedding: Vector,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchHit {
    pub source_type: String,
    pub source_id: Uuid,
    pub similarity: f64,
}

impl ContentEmbedding {
    pub async fn upsert(
        source_type: SourceType,
        source_id: Uuid,
        embedding: &[f32],
        content_hash: &str,
        executor: impl PgExecutor<'_>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_embeddings (source_type, source_id, embedding, content_hash)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_type, source_id) DO UPDATE
                SET embedding = EXCLUDED.embedding,
                    content_hash = EXCLUDED.content_hash,
                    updated_at = now()
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(Vector::from(embedding.to_vec()))
        .bind(content_hash)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_for(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM content_embeddings WHERE source_type = $1 AND source_id = $2",
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Nearest posts and replies to `query`, most similar first.
    ///
    /// Similarity is `1 - cosine distance`; only hits with similarity at or
    /// above `threshold` are returned.
    pub async fn semantic_search(
        query: &[f32],
        limit: i64,
        threshold: f64,
        pool: &PgPool,
    ) -> Result<Vec<SearchHit>> {
        sqlx::query_as::<_, SearchHit>(
            r#"
            SELECT source_type, source_id,
                   (1 - (embedding <=> $1))::float8 AS similarity
            FROM content_embeddings
            WHERE 1 - (embedding <=> $1) >= $2
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(threshold)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Search with the configured `[search] default_threshold`.
    pub async fn semantic_search_default(
        query: &[f32],
        limit: i64,
        config: &SearchConfig,
        pool: &PgPool,
    ) -> Result<Vec<SearchHit>> {
        Self::semantic_search(query, limit, config.default_threshold, pool).await
    }
}
