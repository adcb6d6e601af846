//! pgvector-backed vector index.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::CoreError;

use super::{SearchHit, VectorIndex, VectorPoint};

pub struct PgVectorIndex {
    pool: PgPool,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct HitRow {
    point_id: Uuid,
    asset_id: String,
    segment_id: String,
    model: String,
    model_ver: String,
    distance: f64,
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, point: VectorPoint) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (
                point_id, org_id, asset_id, segment_id, modality, model, model_ver,
                text_len, truncated_len, job_id, embedding, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (point_id) DO UPDATE SET
                modality = EXCLUDED.modality,
                text_len = EXCLUDED.text_len,
                truncated_len = EXCLUDED.truncated_len,
                job_id = EXCLUDED.job_id,
                embedding = EXCLUDED.embedding,
                updated_at = NOW()
            "#,
        )
        .bind(point.point_id)
        .bind(point.org_id)
        .bind(&point.asset_id)
        .bind(&point.segment_id)
        .bind(&point.modality)
        .bind(&point.model)
        .bind(&point.model_ver)
        .bind(point.text_len)
        .bind(point.truncated_len)
        .bind(point.job_id)
        .bind(Vector::from(point.embedding))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search(
        &self,
        org_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, CoreError> {
        let rows = sqlx::query_as::<_, HitRow>(
            r#"
            SELECT point_id, asset_id, segment_id, model, model_ver,
                   (embedding <=> $2)::FLOAT8 AS distance
            FROM embeddings
            WHERE org_id = $1
            ORDER BY embedding <=> $2
            LIMIT $3
            "#,
        )
        .bind(org_id)
        .bind(Vector::from(query.to_vec()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                point_id: row.point_id,
                // Cosine distance is in [0, 2]; map to a [0, 1] similarity.
                score: (1.0 - row.distance / 2.0) as f32,
                asset_id: row.asset_id,
                segment_id: row.segment_id,
                model: row.model,
                model_ver: row.model_ver,
            })
            .collect())
    }
}
