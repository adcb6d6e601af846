//! Outbox rows: pending broker messages co-located with the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

/// A durable pending message. Created in the same transaction as its job;
/// mutated only by the dispatcher afterwards. `sent_at` moves from NULL to a
/// timestamp exactly once; `fail_count` never decreases.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub job_id: Uuid,
    pub task_name: String,
    pub payload: Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub fail_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for inserting an outbox row.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub task_name: String,
    pub payload: Value,
}

/// Wire body handed to the broker: everything the worker needs to route and
/// run the task. `args[0]` is always the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub queue_name: String,
    pub task_name: String,
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl TaskMessage {
    pub fn new(queue_name: impl Into<String>, task_name: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            queue_name: queue_name.into(),
            task_name: task_name.into(),
            args: vec![Value::String(job_id.to_string())],
            kwargs: Map::new(),
            options: Map::new(),
        }
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// The job id this message targets, parsed from `args[0]`.
    pub fn job_id(&self) -> Option<Uuid> {
        self.args
            .first()
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Rebuild a task message from a stored outbox row.
    ///
    /// The payload keeps queue/args/kwargs/options; the task name rides in
    /// its own column for routing queries.
    pub fn from_outbox(row: &OutboxMessage) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct StoredPayload {
            #[serde(default = "default_queue")]
            queue_name: String,
            #[serde(default)]
            args: Vec<Value>,
            #[serde(default)]
            kwargs: Map<String, Value>,
            #[serde(default)]
            options: Map<String, Value>,
        }
        let stored: StoredPayload = serde_json::from_value(row.payload.clone())?;
        Ok(Self {
            queue_name: stored.queue_name,
            task_name: row.task_name.clone(),
            args: stored.args,
            kwargs: stored.kwargs,
            options: stored.options,
        })
    }

    /// The payload persisted to the outbox (everything but the task name).
    pub fn outbox_payload(&self) -> Value {
        serde_json::json!({
            "queue_name": self.queue_name,
            "args": self.args,
            "kwargs": self.kwargs,
            "options": self.options,
        })
    }
}

fn default_queue() -> String {
    "default".to_string()
}
