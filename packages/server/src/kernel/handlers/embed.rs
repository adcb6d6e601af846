//! Embedding handlers: deterministic mock vectors and the real adapter path.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::common::CoreError;
use crate::kernel::jobs::{JobContext, JobHandler};
use crate::kernel::vector::{point_id_for, VectorPoint};

fn required_str<'a>(kwargs: &'a Map<String, Value>, key: &str) -> Result<&'a str, CoreError> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::Validation(format!("missing required kwarg: {key}")))
}

fn required_org(kwargs: &Map<String, Value>) -> Result<Uuid, CoreError> {
    let raw = required_str(kwargs, "org_id")?;
    Uuid::parse_str(raw).map_err(|_| CoreError::Validation(format!("invalid org_id: {raw}")))
}

/// Truncate to `max_len` characters on a char boundary.
fn truncate_text(text: &str, max_len: usize) -> (&str, usize) {
    match text.char_indices().nth(max_len) {
        Some((byte_idx, _)) => (&text[..byte_idx], max_len),
        None => (text, text.chars().count()),
    }
}

/// "Hello write" flow: a deterministic vector derived from the segment
/// identity, upserted under the `mock` model tag.
pub struct MockEmbeddingHandler;

#[async_trait]
impl JobHandler for MockEmbeddingHandler {
    fn name(&self) -> &'static str {
        "mock_embedding"
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Option<Value>, CoreError> {
        let org_id = required_org(kwargs)?;
        let asset_id = required_str(kwargs, "asset_id")?;
        let segment_id = required_str(kwargs, "segment_id")?;

        ctx.progress("generating_embedding", 40).await?;

        // Seeded by the identity, so repeat runs land on the same vector.
        let seed = format!("{org_id}:{asset_id}:{segment_id}");
        let vector = ctx.kernel().embedder.embed(&seed)?;

        ctx.progress("upserting_vector", 80).await?;

        let point_id = point_id_for(org_id, asset_id, segment_id, "mock", "v1");
        ctx.kernel()
            .vectors
            .upsert(VectorPoint {
                point_id,
                org_id,
                asset_id: asset_id.to_string(),
                segment_id: segment_id.to_string(),
                modality: "text".to_string(),
                model: "mock".to_string(),
                model_ver: "v1".to_string(),
                text_len: seed.len() as i32,
                truncated_len: seed.len() as i32,
                job_id: Some(ctx.job().id),
                embedding: vector.clone(),
            })
            .await?;

        info!(job_id = %ctx.job().id, %point_id, "mock embedding upserted");

        Ok(Some(json!({
            "point_id": point_id,
            "vector_size": vector.len(),
            "model": "mock",
            "model_ver": "v1",
            "asset_id": asset_id,
            "segment_id": segment_id,
        })))
    }
}

/// Production embedding path: validate, truncate to the adapter's input
/// bound, embed, and upsert with a PII-minimized payload. The raw text
/// arrives only in the broker kwargs and is never persisted.
pub struct EmbedTextHandler;

#[async_trait]
impl JobHandler for EmbedTextHandler {
    fn name(&self) -> &'static str {
        "embed_text"
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Option<Value>, CoreError> {
        let org_id = required_org(kwargs)?;
        let asset_id = required_str(kwargs, "asset_id")?;
        let segment_id = required_str(kwargs, "segment_id")?;
        let text = required_str(kwargs, "text")?;
        if text.trim().is_empty() {
            return Err(CoreError::Validation("text cannot be empty".to_string()));
        }

        let embedder = &ctx.kernel().embedder;
        let model = kwargs
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(embedder.name())
            .to_string();
        let model_ver = kwargs
            .get("model_ver")
            .and_then(Value::as_str)
            .unwrap_or(embedder.version())
            .to_string();

        ctx.progress("preprocessing_text", 20).await?;

        let text_len = text.chars().count();
        let (to_embed, truncated_len) = truncate_text(text, embedder.max_len());
        let text_hash = crate::common::job_key::text_hash(text);

        ctx.progress("generating_embedding", 40).await?;

        let vector = embedder.embed(to_embed)?;
        let expected_dim = ctx.kernel().config.vector_size;
        if vector.len() != expected_dim {
            return Err(CoreError::Validation(format!(
                "dimension mismatch: adapter produced {} but index expects {expected_dim}",
                vector.len()
            )));
        }

        ctx.progress("upserting_vector", 80).await?;

        // Point id excludes the text hash: changed text overwrites the same
        // logical point (latest wins).
        let point_id = point_id_for(org_id, asset_id, segment_id, &model, &model_ver);
        ctx.kernel()
            .vectors
            .upsert(VectorPoint {
                point_id,
                org_id,
                asset_id: asset_id.to_string(),
                segment_id: segment_id.to_string(),
                modality: "text".to_string(),
                model: model.clone(),
                model_ver: model_ver.clone(),
                text_len: text_len as i32,
                truncated_len: truncated_len as i32,
                job_id: Some(ctx.job().id),
                embedding: vector.clone(),
            })
            .await?;

        info!(job_id = %ctx.job().id, %point_id, text_len, truncated_len, "embedding upserted");

        Ok(Some(json!({
            "point_id": point_id,
            "vector_size": vector.len(),
            "model": model,
            "model_ver": model_ver,
            "text_len": text_len,
            "truncated_len": truncated_len,
            "text_hash": text_hash,
            "asset_id": asset_id,
            "segment_id": segment_id,
        })))
    }
}
