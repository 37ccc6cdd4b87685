use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::canonical_claim::CanonicalClaim;

/// Links one ADU to the canonical claim it expresses. An ADU has at most one
/// mapping; relinking replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalMapping {
    pub adu_id: Uuid,
    pub canonical_claim_id: Uuid,
    pub similarity_score: f64,
    pub created_at: DateTime<Utc>,
}

impl CanonicalMapping {
    /// Link an ADU to an existing canonical claim and refresh the counters of
    /// every claim the link touched.
    pub async fn link(
        adu_id: Uuid,
        canonical_claim_id: Uuid,
        similarity_score: f64,
        pool: &PgPool,
    ) -> Result<Self> {
        let mut tx = pool.begin().await?;
        let mapping = Self::link_in(adu_id, canonical_claim_id, similarity_score, &mut *tx).await?;
        tx.commit().await?;
        Ok(mapping)
    }

    /// Same as [`CanonicalMapping::link`], inside the caller's transaction.
    pub async fn link_in(
        adu_id: Uuid,
        canonical_claim_id: Uuid,
        similarity_score: f64,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        Self::lock_adu(adu_id, &mut *conn).await?;

        let previous: Option<(Uuid,)> = sqlx::query_as(
            "SELECT canonical_claim_id FROM adu_canonical_map WHERE adu_id = $1 FOR UPDATE",
        )
        .bind(adu_id)
        .fetch_optional(&mut *conn)
        .await?;

        let mut affected = vec![canonical_claim_id];
        if let Some((old,)) = previous {
            if old != canonical_claim_id {
                affected.push(old);
            }
        }

        CanonicalClaim::lock(&affected, &mut *conn).await?;

        let mapping = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO adu_canonical_map (adu_id, canonical_claim_id, similarity_score)
            VALUES ($1, $2, $3)
            ON CONFLICT (adu_id) DO UPDATE
                SET canonical_claim_id = EXCLUDED.canonical_claim_id,
                    similarity_score = EXCLUDED.similarity_score,
                    created_at = now()
            RETURNING *
            "#,
        )
        .bind(adu_id)
        .bind(canonical_claim_id)
        .bind(similarity_score)
        .fetch_one(&mut *conn)
        .await?;

        CanonicalClaim::refresh_counters(&affected, &mut *conn).await?;

        Ok(mapping)
    }

    /// Serialise mapping changes for one ADU. Taken before any claim lock.
    pub async fn lock_adu(adu_id: Uuid, conn: &mut PgConnection) -> Result<()> {
        sqlx::query("SELECT id FROM adus WHERE id = $1 FOR UPDATE")
            .bind(adu_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| anyhow!("ADU {adu_id} not found"))?;
        Ok(())
    }

    pub async fn find_for_adu(adu_id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM adu_canonical_map WHERE adu_id = $1")
            .bind(adu_id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn for_adus(adu_ids: &[Uuid], pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM adu_canonical_map WHERE adu_id = ANY($1)")
            .bind(adu_ids)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn for_claim(canonical_claim_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM adu_canonical_map WHERE canonical_claim_id = $1 ORDER BY created_at",
        )
        .bind(canonical_claim_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
