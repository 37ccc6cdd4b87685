use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dialectic_core::RelationType;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// A support or attack edge between two ADUs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArgumentRelation {
    pub id: Uuid,
    pub source_adu_id: Uuid,
    pub target_adu_id: Uuid,
    pub relation_type: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRelation {
    pub source_adu_id: Uuid,
    pub target_adu_id: Uuid,
    pub relation_type: RelationType,
    pub confidence: f64,
}

impl ArgumentRelation {
    /// Insert a batch of relations. Re-detecting an existing edge refreshes its
    /// confidence. An empty batch is a no-op.
    pub async fn create_batch(batch: &[NewRelation], pool: &PgPool) -> Result<u64> {
        // One row per edge key, last wins; Postgres rejects a single upsert
        // touching the same row twice.
        let mut unique: HashMap<(Uuid, Uuid, RelationType), &NewRelation> = HashMap::new();
        for rel in batch {
            unique.insert((rel.source_adu_id, rel.target_adu_id, rel.relation_type), rel);
        }
        if unique.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO argument_relations (source_adu_id, target_adu_id, relation_type, confidence) ",
        );
        qb.push_values(unique.values(), |mut b, rel| {
            b.push_bind(rel.source_adu_id)
                .push_bind(rel.target_adu_id)
                .push_bind(rel.relation_type.as_str())
                .push_bind(rel.confidence);
        });
        qb.push(
            " ON CONFLICT (source_adu_id, target_adu_id, relation_type) \
             DO UPDATE SET confidence = EXCLUDED.confidence",
        );

        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// Relations touching any of the given ADUs.
    pub async fn find_for_adus(adu_ids: &[Uuid], pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM argument_relations
            WHERE source_adu_id = ANY($1) OR target_adu_id = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(adu_ids)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
