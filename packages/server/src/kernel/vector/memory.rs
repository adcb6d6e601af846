//! In-memory vector index for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::CoreError;

use super::{cosine_score, SearchHit, VectorIndex, VectorPoint};

#[derive(Default)]
pub struct MemoryVectorIndex {
    points: Mutex<HashMap<Uuid, VectorPoint>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().expect("index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, point_id: Uuid) -> Option<VectorPoint> {
        self.points.lock().expect("index lock").get(&point_id).cloned()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, point: VectorPoint) -> Result<(), CoreError> {
        self.points
            .lock()
            .expect("index lock")
            .insert(point.point_id, point);
        Ok(())
    }

    async fn search(
        &self,
        org_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, CoreError> {
        let points = self.points.lock().expect("index lock");

        let mut hits: Vec<SearchHit> = points
            .values()
            .filter(|p| p.org_id == org_id)
            .map(|p| SearchHit {
                point_id: p.point_id,
                score: cosine_score(&p.embedding, query),
                asset_id: p.asset_id.clone(),
                segment_id: p.segment_id.clone(),
                model: p.model.clone(),
                model_ver: p.model_ver.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::super::point_id_for;
    use super::*;

    fn point(org_id: Uuid, asset_id: &str, embedding: Vec<f32>) -> VectorPoint {
        VectorPoint {
            point_id: point_id_for(org_id, asset_id, "chunk_0", "hash", "v1"),
            org_id,
            asset_id: asset_id.to_string(),
            segment_id: "chunk_0".to_string(),
            modality: "text".to_string(),
            model: "hash".to_string(),
            model_ver: "v1".to_string(),
            text_len: 10,
            truncated_len: 10,
            job_id: None,
            embedding,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_by_point_id() {
        let index = MemoryVectorIndex::new();
        let org = Uuid::new_v4();
        index.upsert(point(org, "doc_1", vec![1.0, 0.0])).await.unwrap();
        index.upsert(point(org, "doc_1", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn search_is_tenant_scoped_and_ranked() {
        let index = MemoryVectorIndex::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        index.upsert(point(org_a, "close", vec![1.0, 0.0])).await.unwrap();
        index.upsert(point(org_a, "far", vec![0.0, 1.0])).await.unwrap();
        index.upsert(point(org_b, "other_tenant", vec![1.0, 0.0])).await.unwrap();

        let hits = index.search(org_a, &[1.0, 0.1], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].asset_id, "close");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.asset_id != "other_tenant"));
    }
}
