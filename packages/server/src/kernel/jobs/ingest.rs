//! Ingest service: idempotent job submission through the transactional outbox.
//!
//! Submission never talks to the broker. It computes the job key, then
//! commits the job row, its initial event, and the outbox row in one
//! transaction; the dispatcher publishes later. A duplicate submission is
//! success and returns the existing job id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::common::{job_key, CoreError};

use super::job::NewJob;
use super::outbox::{NewOutboxMessage, TaskMessage};
use super::store::{CreateOutcome, JobStore};

/// One registered operation type: broker routing plus the projection that
/// decides which payload fields are idempotency-relevant.
#[derive(Clone)]
pub struct Operation {
    pub name: &'static str,
    pub task_name: &'static str,
    pub queue_name: &'static str,
    key_payload: fn(&Map<String, Value>) -> Value,
}

impl Operation {
    /// The subset of the payload that participates in the job key. Transient
    /// fields (timestamps, correlation ids) must not survive this projection.
    pub fn key_payload(&self, payload: &Map<String, Value>) -> Value {
        (self.key_payload)(payload)
    }
}

/// Operation types known to the platform, keyed by job type name.
pub struct OperationCatalog {
    operations: HashMap<&'static str, Operation>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    pub fn register(&mut self, op: Operation) {
        self.operations.insert(op.name, op);
    }

    pub fn get(&self, job_type: &str) -> Option<&Operation> {
        self.operations.get(job_type)
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.operations.values().map(|op| op.task_name).collect()
    }

    /// The built-in operations: the staged mock pipeline and the two
    /// embedding flows.
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        catalog.register(Operation {
            name: "mock",
            task_name: "process_mock",
            queue_name: "default",
            // The whole payload identifies a mock job.
            key_payload: |payload| Value::Object(payload.clone()),
        });
        catalog.register(Operation {
            name: "mock_embedding",
            task_name: "mock_embedding",
            queue_name: "default",
            key_payload: |payload| {
                json!({
                    "asset_id": payload.get("asset_id").cloned().unwrap_or(Value::Null),
                    "segment_id": payload.get("segment_id").cloned().unwrap_or(Value::Null),
                    "model": "mock",
                    "model_ver": "v1",
                })
            },
        });
        catalog.register(Operation {
            name: "embed_text",
            task_name: "embed_text",
            queue_name: "default",
            // Keyed on the content hash, never the content: re-submitting the
            // same segment with changed text is a new job.
            key_payload: |payload| {
                let text = payload.get("text").and_then(Value::as_str).unwrap_or("");
                json!({
                    "asset_id": payload.get("asset_id").cloned().unwrap_or(Value::Null),
                    "segment_id": payload.get("segment_id").cloned().unwrap_or(Value::Null),
                    "text_hash": job_key::text_hash(text),
                    "model": payload.get("model").cloned().unwrap_or(Value::Null),
                    "model_ver": payload.get("model_ver").cloned().unwrap_or(Value::Null),
                })
            },
        });
        catalog
    }
}

impl Default for OperationCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// A job-creation command.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_type: String,
    pub payload: Map<String, Value>,
    /// Client-supplied deduplication token, tenant-scoped.
    pub idempotency_key: Option<String>,
    /// Stage at which the mock pipeline fails deterministically (testing).
    pub fail_at: Option<String>,
    pub max_attempts: Option<i32>,
}

impl SubmitRequest {
    pub fn new(job_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            idempotency_key: None,
            fail_at: None,
            max_attempts: None,
        }
    }

    pub fn fail_at(mut self, stage: impl Into<String>) -> Self {
        self.fail_at = Some(stage.into());
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

pub struct IngestService {
    store: Arc<dyn JobStore>,
    catalog: OperationCatalog,
    default_max_attempts: i32,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: OperationCatalog,
        default_max_attempts: i32,
    ) -> Self {
        Self {
            store,
            catalog,
            default_max_attempts,
        }
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    /// Submit a job for a tenant. Returns the created or existing job id;
    /// a duplicate submission is not an error.
    pub async fn submit(
        &self,
        org_id: Uuid,
        requested_by: Option<String>,
        request: SubmitRequest,
    ) -> Result<CreateOutcome, CoreError> {
        let op = self.catalog.get(&request.job_type).ok_or_else(|| {
            CoreError::Validation(format!("unknown job type: {}", request.job_type))
        })?;

        let key = job_key::job_key(org_id, op.name, &op.key_payload(&request.payload));

        let mut new_job = NewJob::new(org_id, op.name, key)
            .idempotency_key(request.idempotency_key.clone())
            .max_attempts(request.max_attempts.unwrap_or(self.default_max_attempts));
        new_job.requested_by = requested_by;

        // The outbox payload carries everything broker and worker need:
        // args[0] is the job id, kwargs are the operation inputs.
        let mut message = TaskMessage::new(op.queue_name, op.task_name, new_job.id);
        message = message.kwarg("org_id", Value::String(org_id.to_string()));
        for (k, v) in &request.payload {
            message = message.kwarg(k.clone(), v.clone());
        }
        if let Some(stage) = &request.fail_at {
            message = message.kwarg("fail_at", Value::String(stage.clone()));
        }

        let outcome = self
            .store
            .create_with_outbox(
                new_job,
                NewOutboxMessage {
                    task_name: op.task_name.to_string(),
                    payload: message.outbox_payload(),
                },
            )
            .await?;

        match &outcome {
            CreateOutcome::Created(job) => {
                info!(job_id = %job.id, org_id = %org_id, job_type = %job.job_type, "job submitted");
            }
            CreateOutcome::Duplicate(id) => {
                info!(job_id = %id, org_id = %org_id, job_type = %request.job_type, "duplicate submission collapsed");
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::testing::MemoryJobStore;

    fn payload(fields: Value) -> Map<String, Value> {
        fields.as_object().cloned().unwrap_or_default()
    }

    fn service() -> IngestService {
        IngestService::new(Arc::new(MemoryJobStore::new()), OperationCatalog::standard(), 3)
    }

    #[test]
    fn catalog_knows_the_builtin_operations() {
        let catalog = OperationCatalog::standard();
        assert!(catalog.get("mock").is_some());
        assert!(catalog.get("mock_embedding").is_some());
        assert!(catalog.get("embed_text").is_some());
        assert!(catalog.get("drive_ingest").is_none());

        let mut tasks = catalog.task_names();
        tasks.sort();
        assert_eq!(tasks, vec!["embed_text", "mock_embedding", "process_mock"]);
    }

    #[test]
    fn embed_text_key_excludes_raw_text() {
        let catalog = OperationCatalog::standard();
        let op = catalog.get("embed_text").unwrap();
        let key = op.key_payload(&payload(json!({
            "asset_id": "doc_1",
            "segment_id": "chunk_0",
            "text": "sensitive content",
            "model": "hash",
            "model_ver": "v1",
        })));
        assert!(key.get("text").is_none());
        assert_eq!(key["text_hash"].as_str().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_job_type() {
        let err = service()
            .submit(
                Uuid::new_v4(),
                None,
                SubmitRequest::new("drive_ingest", Map::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn identical_submissions_collapse() {
        let ingest = service();
        let org = Uuid::new_v4();

        let first = ingest
            .submit(org, None, SubmitRequest::new("mock", payload(json!({"k": "v"}))))
            .await
            .unwrap();
        let second = ingest
            .submit(org, None, SubmitRequest::new("mock", payload(json!({"k": "v"}))))
            .await
            .unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn same_payload_different_tenant_creates_two_jobs() {
        let ingest = service();
        let body = payload(json!({"k": "v"}));

        let a = ingest
            .submit(Uuid::new_v4(), None, SubmitRequest::new("mock", body.clone()))
            .await
            .unwrap();
        let b = ingest
            .submit(Uuid::new_v4(), None, SubmitRequest::new("mock", body))
            .await
            .unwrap();

        assert!(a.is_created());
        assert!(b.is_created());
        assert_ne!(a.job_id(), b.job_id());
    }
}
