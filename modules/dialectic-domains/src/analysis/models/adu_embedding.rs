use anyhow::Result;
use pgvector::Vector;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

pub struct AduEmbedding;

impl AduEmbedding {
    /// Write one embedding per ADU in a single statement. An empty batch is a
    /// no-op.
    pub async fn create_batch(
        batch: &[(Uuid, &[f32])],
        executor: impl PgExecutor<'_>,
    ) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO adu_embeddings (adu_id, embedding) ");
        qb.push_values(batch, |mut b, (adu_id, embedding)| {
            b.push_bind(*adu_id).push_bind(Vector::from(embedding.to_vec()));
        });
        qb.push(" ON CONFLICT (adu_id) DO UPDATE SET embedding = EXCLUDED.embedding");

        let result = qb.build().execute(executor).await?;
        Ok(result.rows_affected())
    }

    pub async fn find_for_adu(adu_id: Uuid, pool: &PgPool) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query_as::<_, (Vector,)>(
            "SELECT embedding FROM adu_embeddings WHERE adu_id = $1",
        )
        .bind(adu_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(v,)| v.to_vec()))
    }
}
