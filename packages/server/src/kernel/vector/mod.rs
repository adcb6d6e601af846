//! Vector index seam: tenant-scoped storage and similarity search for
//! embedded segments.
//!
//! Point ids are deterministic hashes of the logical identity (org, asset,
//! segment, model, model version) so re-embedding the same segment
//! overwrites in place, latest wins. The content hash deliberately does not
//! participate: changed text maps to the same point.

mod memory;
mod pg;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::CoreError;

pub use memory::MemoryVectorIndex;
pub use pg::PgVectorIndex;

/// One stored vector with its PII-minimized metadata. Raw text never
/// appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub point_id: Uuid,
    pub org_id: Uuid,
    pub asset_id: String,
    pub segment_id: String,
    pub modality: String,
    pub model: String,
    pub model_ver: String,
    pub text_len: i32,
    pub truncated_len: i32,
    pub job_id: Option<Uuid>,
    pub embedding: Vec<f32>,
}

/// A similarity search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub point_id: Uuid,
    /// Cosine similarity in [0, 1]; higher is closer.
    pub score: f32,
    pub asset_id: String,
    pub segment_id: String,
    pub model: String,
    pub model_ver: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite a point. Idempotent by `point_id`.
    async fn upsert(&self, point: VectorPoint) -> Result<(), CoreError>;

    /// Top-`limit` nearest points for a tenant.
    async fn search(
        &self,
        org_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, CoreError>;
}

/// Deterministic point id: UUID from the first 16 bytes of the SHA-256 of
/// the logical identity.
pub fn point_id_for(
    org_id: Uuid,
    asset_id: &str,
    segment_id: &str,
    model: &str,
    model_ver: &str,
) -> Uuid {
    let composite = format!("{org_id}:{asset_id}:{segment_id}:{model}:{model_ver}");
    let digest = Sha256::digest(composite.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Cosine similarity of two equal-length vectors, mapped from [-1, 1] to
/// [0, 1].
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a * norm_b);
    ((cosine + 1.0) / 2.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_deterministic() {
        let org = Uuid::new_v4();
        let a = point_id_for(org, "doc_1", "chunk_0", "hash", "v1");
        let b = point_id_for(org, "doc_1", "chunk_0", "hash", "v1");
        assert_eq!(a, b);
    }

    #[test]
    fn point_id_varies_by_each_component() {
        let org = Uuid::new_v4();
        let base = point_id_for(org, "doc_1", "chunk_0", "hash", "v1");
        assert_ne!(base, point_id_for(Uuid::new_v4(), "doc_1", "chunk_0", "hash", "v1"));
        assert_ne!(base, point_id_for(org, "doc_2", "chunk_0", "hash", "v1"));
        assert_ne!(base, point_id_for(org, "doc_1", "chunk_1", "hash", "v1"));
        assert_ne!(base, point_id_for(org, "doc_1", "chunk_0", "minilm", "v1"));
        assert_ne!(base, point_id_for(org, "doc_1", "chunk_0", "hash", "v2"));
    }

    #[test]
    fn cosine_score_of_identical_vectors_is_one() {
        let v = vec![0.5f32, -0.5, 0.7];
        assert!((cosine_score(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_score_of_opposite_vectors_is_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![-1.0f32, 0.0];
        assert!(cosine_score(&a, &b).abs() < 1e-6);
    }
}
