//! Storage seam for the job ledger and the transactional outbox.
//!
//! The two live behind one trait because ingest must write a job row, its
//! initial event, and an outbox row in a single atomic commit. The database
//! is the sole authority for this state; every mutation path serializes on
//! the job's row lock.

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::CoreError;

use super::events::{EventDetail, JobEvent};
use super::job::{Job, NewJob, Transition};
use super::outbox::{NewOutboxMessage, OutboxMessage};

/// Result of an idempotent creation attempt.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// The job, its initial event, and its outbox row were committed.
    Created(Job),
    /// A job with the same key already existed; nothing was written.
    Duplicate(Uuid),
}

impl CreateOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            CreateOutcome::Created(job) => job.id,
            CreateOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Durable store of jobs, their event log, and their pending messages.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), CoreError>;

    /// Atomically insert a `queued` job, its `None -> queued` event, and one
    /// outbox row. On a `job_key` (or tenant idempotency-key) collision the
    /// existing job id is returned and nothing is written.
    async fn create_with_outbox(
        &self,
        new: NewJob,
        outbox: NewOutboxMessage,
    ) -> Result<CreateOutcome, CoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, CoreError>;

    async fn find_by_job_key(&self, job_key: &str) -> Result<Option<Job>, CoreError>;

    /// Most recent event; its detail blob is the source of truth for
    /// stage/progress/result projections.
    async fn latest_event(&self, job_id: Uuid) -> Result<Option<JobEvent>, CoreError>;

    /// Full timeline, ordered by `ts` ascending.
    async fn events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, CoreError>;

    /// Apply a status change under the job's row lock, appending a JobEvent.
    ///
    /// Illegal edges fail with [`CoreError::InvalidStateTransition`] and
    /// mutate nothing.
    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, CoreError>;

    /// Same-status write carrying stage/progress detail. Must be non-empty.
    /// Appends a JobEvent only when `emit_event` is set.
    async fn record_progress(
        &self,
        job_id: Uuid,
        detail: EventDetail,
        emit_event: bool,
    ) -> Result<(), CoreError>;

    /// Claim up to `limit` unsent outbox rows, oldest first, skipping rows
    /// locked by concurrent dispatchers. The claim owns an open transaction:
    /// dropping it without committing leaves every row pending.
    async fn begin_dispatch(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, CoreError>;

    /// All outbox rows for a job, oldest first.
    async fn outbox_for_job(&self, job_id: Uuid) -> Result<Vec<OutboxMessage>, CoreError>;
}

/// A batch of claimed outbox rows plus the transaction that locks them.
#[async_trait]
pub trait OutboxClaim: Send {
    fn messages(&self) -> &[OutboxMessage];

    /// Record a successful publish. `sent_at` is stamped at most once.
    async fn mark_sent(&mut self, outbox_id: i64) -> Result<(), CoreError>;

    /// Record a failed publish attempt: bump `fail_count`, keep the row
    /// pending for the next tick.
    async fn mark_failed(&mut self, outbox_id: i64, error: &str) -> Result<(), CoreError>;

    async fn commit(self: Box<Self>) -> Result<(), CoreError>;
}
