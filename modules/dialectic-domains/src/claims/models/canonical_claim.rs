use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dialectic_core::claim_text_hash;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::canonical_mapping::CanonicalMapping;

/// A deduplicated assertion that ADUs across discussions map onto.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalClaim {
    pub id: Uuid,
    pub representative_text: String,
    pub text_hash: String,
    pub author_id: Option<Uuid>,
    pub adu_count: i32,
    pub discussion_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A nearest-neighbour hit from the canonical claim index.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SimilarClaim {
    pub id: Uuid,
    pub representative_text: String,
    pub similarity: f64,
}

/// What `create_and_link` did.
#[derive(Debug, Clone)]
pub struct CreatedClaim {
    pub claim: CanonicalClaim,
    /// False when a claim with the same normalized text already existed and
    /// the ADU was linked to it instead.
    pub inserted: bool,
}

impl CanonicalClaim {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM canonical_claims WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Up to `limit` claims whose cosine similarity to `embedding` is at least
    /// `floor`, most similar first.
    pub async fn find_similar(
        embedding: &[f32],
        limit: i64,
        floor: f64,
        pool: &PgPool,
    ) -> Result<Vec<SimilarClaim>> {
        sqlx::query_as::<_, SimilarClaim>(
            r#"
            SELECT c.id, c.representative_text,
                   (1 - (e.embedding <=> $1))::float8 AS similarity
            FROM canonical_claim_embeddings e
            JOIN canonical_claims c ON c.id = e.canonical_claim_id
            WHERE 1 - (e.embedding <=> $1) >= $2
            ORDER BY e.embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(Vector::from(embedding.to_vec()))
        .bind(floor)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Create a canonical claim for `text` and link `adu_id` to it, in one
    /// transaction.
    ///
    /// Claims are unique on normalized text, so two workers racing to create
    /// the same claim converge on one row; the loser links to the winner's.
    pub async fn create_and_link(
        text: &str,
        author_id: Option<Uuid>,
        embedding: &[f32],
        adu_id: Uuid,
        pool: &PgPool,
    ) -> Result<CreatedClaim> {
        let mut tx = pool.begin().await?;
        CanonicalMapping::lock_adu(adu_id, &mut *tx).await?;

        let (id, inserted) = sqlx::query_as::<_, (Uuid, bool)>(
            r#"
            INSERT INTO canonical_claims (representative_text, text_hash, author_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (text_hash) DO UPDATE SET updated_at = now()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(text)
        .bind(claim_text_hash(text))
        .bind(author_id)
        .fetch_one(&mut *tx)
        .await?;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO canonical_claim_embeddings (canonical_claim_id, embedding)
                VALUES ($1, $2)
                ON CONFLICT (canonical_claim_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(Vector::from(embedding.to_vec()))
            .execute(&mut *tx)
            .await?;
        }

        CanonicalMapping::link_in(adu_id, id, 1.0, &mut *tx).await?;

        let claim = sqlx::query_as::<_, Self>("SELECT * FROM canonical_claims WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CreatedClaim { claim, inserted })
    }

    /// Row-lock the given claims in id order. Fails if any is missing.
    pub async fn lock(ids: &[Uuid], conn: &mut PgConnection) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let locked: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM canonical_claims WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&sorted)
        .fetch_all(&mut *conn)
        .await?;

        if locked.len() != sorted.len() {
            let missing = sorted
                .iter()
                .find(|id| !locked.iter().any(|(l,)| l == *id))
                .copied()
                .unwrap_or_default();
            return Err(anyhow!("canonical claim {missing} not found"));
        }
        Ok(())
    }

    /// Recompute `adu_count` and `discussion_count` from the mapping table.
    ///
    /// Callers must hold the row locks (see [`CanonicalClaim::lock`]) so the
    /// counts match the mapping set at commit.
    pub async fn refresh_counters(ids: &[Uuid], conn: &mut PgConnection) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE canonical_claims c
            SET adu_count = s.adu_count,
                discussion_count = s.discussion_count,
                updated_at = now()
            FROM (
                SELECT ids.id,
                       COUNT(m.adu_id)::int4 AS adu_count,
                       COUNT(DISTINCT a.source_type || ':' || a.source_id::text)::int4 AS discussion_count
                FROM UNNEST($1::uuid[]) AS ids(id)
                LEFT JOIN adu_canonical_map m ON m.canonical_claim_id = ids.id
                LEFT JOIN adus a ON a.id = m.adu_id
                GROUP BY ids.id
            ) s
            WHERE c.id = s.id
            "#,
        )
        .bind(ids)
        .execute(conn)
        .await?;
        Ok(())
    }
}
