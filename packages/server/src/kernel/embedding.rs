//! Embedding adapter seam.
//!
//! Workers and the query-time search path embed text through this trait so
//! the model backend stays pluggable. The in-tree implementation is a
//! deterministic hash-seeded embedder: stable across processes, cheap, and
//! good enough for the mock flow, local development, and the test suite.

use sha2::{Digest, Sha256};

use crate::common::CoreError;

/// A text embedding model.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    /// Output dimensionality; must match the vector index.
    fn dim(&self) -> usize;
    /// Maximum input length in characters; longer inputs are truncated by
    /// the caller before embedding.
    fn max_len(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError>;
}

/// Deterministic embedder seeded by the text bytes.
///
/// Expands SHA-256 of the input into `dim` pseudo-random components and
/// L2-normalizes, so cosine similarity is well-defined and identical text
/// always lands on the identical vector.
pub struct HashEmbedder {
    name: String,
    version: String,
    dim: usize,
}

impl HashEmbedder {
    pub fn new(name: impl Into<String>, version: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dim,
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new("hash", "v1", 384)
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        2_000
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        if text.trim().is_empty() {
            return Err(CoreError::Validation("text cannot be empty".to_string()));
        }

        let mut components = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;
        while components.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_be_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if components.len() == self.dim {
                    break;
                }
                let raw = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1).
                components.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }

        let norm = components.iter().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for component in &mut components {
                *component = (*component as f64 / norm) as f32;
            }
        }

        Ok(components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("the quick brown fox").unwrap();
        let b = embedder.embed("the quick brown fox").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[test]
    fn different_text_produces_different_vectors() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("alpha").unwrap();
        let b = embedder.embed("beta").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn vectors_are_unit_length() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed("normalize me").unwrap();
        let norm: f64 = v.iter().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[test]
    fn empty_text_is_a_validation_error() {
        let embedder = HashEmbedder::default();
        assert!(matches!(
            embedder.embed("   "),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn honors_configured_dimension() {
        let embedder = HashEmbedder::new("hash", "v1", 8);
        assert_eq!(embedder.embed("tiny").unwrap().len(), 8);
    }
}
