use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dialectic_core::{AduType, SourceType};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::adu_embedding::AduEmbedding;
use super::analysis_run::AnalysisRun;
use crate::claims::models::canonical_claim::CanonicalClaim;

/// An argumentative discourse unit: a span of a post or reply the engine
/// classified as a claim, premise or conclusion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Adu {
    pub id: Uuid,
    pub analysis_run_id: Uuid,
    pub source_type: String,
    pub source_id: Uuid,
    pub adu_type: String,
    pub text: String,
    pub span_start: i32,
    pub span_end: i32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A validated ADU waiting to be written, with its embedding.
#[derive(Debug, Clone)]
pub struct NewAdu {
    pub adu_type: AduType,
    pub text: String,
    pub span_start: i32,
    pub span_end: i32,
    pub confidence: f64,
    pub embedding: Vec<f32>,
}

impl Adu {
    pub fn kind(&self) -> Result<AduType> {
        self.adu_type.parse().map_err(Into::into)
    }

    pub fn is_claim(&self) -> bool {
        matches!(self.kind(), Ok(AduType::Claim))
    }

    /// Swap the source's ADUs for a fresh set written by `run`.
    ///
    /// One transaction: old ADUs (and, by cascade, their embeddings, mappings
    /// and relations) go, the new ADUs and embeddings land, and every canonical
    /// claim that lost a mapping gets its counters recomputed. The returned
    /// ADUs are in the same order as `new`.
    pub async fn replace_for_source(
        run: &AnalysisRun,
        new: &[NewAdu],
        pool: &PgPool,
    ) -> Result<Vec<Adu>> {
        let mut tx = pool.begin().await?;

        let affected: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT m.canonical_claim_id
            FROM adu_canonical_map m
            JOIN adus a ON a.id = m.adu_id
            WHERE a.source_type = $1 AND a.source_id = $2
            ORDER BY m.canonical_claim_id
            "#,
        )
        .bind(&run.source_type)
        .bind(run.source_id)
        .fetch_all(&mut *tx)
        .await?;
        let affected: Vec<Uuid> = affected.into_iter().map(|(id,)| id).collect();

        // Lock before the cascade removes mappings so concurrent links
        // recount against a stable set.
        CanonicalClaim::lock(&affected, &mut *tx).await?;

        sqlx::query("DELETE FROM adus WHERE source_type = $1 AND source_id = $2")
            .bind(&run.source_type)
            .bind(run.source_id)
            .execute(&mut *tx)
            .await?;

        let mut inserted = Vec::with_capacity(new.len());
        if !new.is_empty() {
            let ids: Vec<Uuid> = new.iter().map(|_| Uuid::new_v4()).collect();

            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO adus (id, analysis_run_id, source_type, source_id, adu_type, \
                 text, span_start, span_end, confidence) ",
            );
            qb.push_values(ids.iter().zip(new), |mut b, (id, adu)| {
                b.push_bind(*id)
                    .push_bind(run.id)
                    .push_bind(&run.source_type)
                    .push_bind(run.source_id)
                    .push_bind(adu.adu_type.as_str())
                    .push_bind(&adu.text)
                    .push_bind(adu.span_start)
                    .push_bind(adu.span_end)
                    .push_bind(adu.confidence);
            });
            qb.push(" RETURNING *");
            let rows: Vec<Adu> = qb.build_query_as().fetch_all(&mut *tx).await?;

            let mut by_id: HashMap<Uuid, Adu> = rows.into_iter().map(|a| (a.id, a)).collect();
            for id in &ids {
                let adu = by_id
                    .remove(id)
                    .ok_or_else(|| anyhow!("inserted ADU {id} missing from RETURNING"))?;
                inserted.push(adu);
            }

            let embeddings: Vec<(Uuid, &[f32])> = ids
                .iter()
                .zip(new)
                .map(|(id, adu)| (*id, adu.embedding.as_slice()))
                .collect();
            AduEmbedding::create_batch(&embeddings, &mut *tx).await?;
        }

        CanonicalClaim::refresh_counters(&affected, &mut *tx).await?;

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn find_by_run(run_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM adus WHERE analysis_run_id = $1 ORDER BY span_start, created_at",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_source(
        source_type: SourceType,
        source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM adus
            WHERE source_type = $1 AND source_id = $2
            ORDER BY span_start, created_at
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Whether `run_id` left any ADUs behind. Recovery's notion of artifacts.
    pub async fn exists_for_run(run_id: Uuid, executor: impl PgExecutor<'_>) -> Result<bool> {
        let row = sqlx::query_as::<_, (bool,)>(
            "SELECT EXISTS (SELECT 1 FROM adus WHERE analysis_run_id = $1)",
        )
        .bind(run_id)
        .fetch_one(executor)
        .await?;
        Ok(row.0)
    }
}
