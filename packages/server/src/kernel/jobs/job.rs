//! Job model: the durable ledger row for one asynchronous task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    DeadLetter,
}

impl JobStatus {
    /// Terminal statuses carry `finished_at` and stop the lifecycle, with
    /// the one sanctioned exception of `failed -> queued` retries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::DeadLetter
        )
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Failed, Queued)
                | (Failed, DeadLetter)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "backoff_policy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Redeliver immediately.
    None,
    /// Wait the configured floor between attempts.
    Fixed,
    /// Double the floor per attempt, bounded by the configured ceiling.
    #[default]
    Exponential,
}

impl BackoffPolicy {
    /// Delay before redelivering a requeued job, in milliseconds.
    ///
    /// `attempt` is the value after the `failed -> queued` increment, so the
    /// first retry of an exponential job waits `min_ms`.
    pub fn delay_ms(&self, attempt: i32, min_ms: u64, max_ms: u64) -> u64 {
        match self {
            BackoffPolicy::None => 0,
            BackoffPolicy::Fixed => min_ms.min(max_ms),
            BackoffPolicy::Exponential => {
                let shift = attempt.saturating_sub(1).clamp(0, 20) as u32;
                min_ms.saturating_mul(1u64 << shift).min(max_ms)
            }
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// One record per logical async task. Mutated only by ingest (creation) and
/// the worker runtime (subsequent transitions), always under a row lock.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    // Tenant & type
    pub org_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,

    // State & control
    pub status: JobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub priority: i32,

    // Idempotency & attribution
    pub job_key: String,
    pub idempotency_key: Option<String>,
    pub requested_by: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    // Error tracking
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
}

/// Parameters for creating a job in `queued` state.
///
/// The id is generated by the caller so the outbox payload can reference the
/// job before the creating transaction commits.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub org_id: Uuid,
    pub job_type: String,
    pub job_key: String,
    pub idempotency_key: Option<String>,
    pub requested_by: Option<String>,
    pub priority: i32,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
}

impl NewJob {
    pub fn new(org_id: Uuid, job_type: impl Into<String>, job_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            job_type: job_type.into(),
            job_key,
            idempotency_key: None,
            requested_by: None,
            priority: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn requested_by(mut self, who: impl Into<String>) -> Self {
        self.requested_by = Some(who.into());
        self
    }

    pub fn idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = n;
        self
    }
}

/// A requested status change, applied atomically under the job's row lock.
///
/// Field effects are derived from the edge, not supplied by the caller:
/// entering `running` stamps `started_at` once, entering a terminal status
/// stamps `finished_at`, and `failed -> queued` / `failed -> dead_letter`
/// advance the attempt counter.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub next: JobStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Opaque blob recorded on the emitted JobEvent (stage, progress, result).
    pub detail: Option<Value>,
}

impl Transition {
    pub fn to(next: JobStatus) -> Self {
        Self {
            next,
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

/// Bound for `last_error_message` and outbox `last_error` columns.
pub const ERROR_MESSAGE_MAX_LEN: usize = 2048;

/// Truncate an error string to the persisted column bound, on a char boundary.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX_LEN {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_MAX_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
