//! PostgreSQL-backed job store.
//!
//! All multi-row effects run inside a single transaction. Writers serialize
//! per job with `SELECT ... FOR UPDATE` on the job row; the outbox claim uses
//! `FOR UPDATE SKIP LOCKED` so concurrent dispatchers partition pending rows
//! without contention.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::common::CoreError;

use super::events::{EventDetail, JobEvent};
use super::job::{truncate_error, Job, JobStatus, NewJob, Transition};
use super::outbox::{NewOutboxMessage, OutboxMessage};
use super::store::{CreateOutcome, JobStore, OutboxClaim};

const JOB_COLUMNS: &str = "id, org_id, type, status, attempt, max_attempts, backoff, priority, \
     job_key, idempotency_key, requested_by, created_at, updated_at, started_at, finished_at, \
     last_error_code, last_error_message";

const OUTBOX_COLUMNS: &str =
    "id, job_id, task_name, payload, sent_at, fail_count, last_error, created_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_job_for_update(
        tx: &mut Transaction<'static, Postgres>,
        job_id: Uuid,
    ) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(CoreError::NotFound)?;

        Ok(job)
    }

    async fn insert_event(
        tx: &mut Transaction<'static, Postgres>,
        job_id: Uuid,
        prev_status: Option<JobStatus>,
        next_status: JobStatus,
        detail: Option<serde_json::Value>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_event (id, job_id, ts, prev_status, next_status, detail)
            VALUES ($1, $2, NOW(), $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(prev_status)
        .bind(next_status)
        .bind(detail)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// True when the error is a unique violation on one of the job
    /// idempotency constraints.
    fn is_idempotency_conflict(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|db| db.constraint())
            .map(|name| name == "uq_job_job_key" || name == "uq_job_org_idempotency")
            .unwrap_or(false)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn ping(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_with_outbox(
        &self,
        new: NewJob,
        outbox: NewOutboxMessage,
    ) -> Result<CreateOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        // Fast path: a logically identical submission already committed.
        if let Some(existing_id) = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM job WHERE job_key = $1",
        )
        .bind(&new.job_key)
        .fetch_optional(&mut *tx)
        .await?
        {
            return Ok(CreateOutcome::Duplicate(existing_id));
        }

        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO job (
                id, org_id, type, status, attempt, max_attempts, backoff, priority,
                job_key, idempotency_key, requested_by
            )
            VALUES ($1, $2, $3, 'queued', 0, $4, $5, $6, $7, $8, $9)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(new.id)
        .bind(new.org_id)
        .bind(&new.job_type)
        .bind(new.max_attempts)
        .bind(new.backoff)
        .bind(new.priority)
        .bind(&new.job_key)
        .bind(&new.idempotency_key)
        .bind(&new.requested_by)
        .fetch_one(&mut *tx)
        .await;

        let job = match inserted {
            Ok(job) => job,
            // Lost a race with a concurrent identical submission: surface the
            // winner's id instead of an error.
            Err(err) if Self::is_idempotency_conflict(&err) => {
                drop(tx);
                let winner = self
                    .find_by_job_key(&new.job_key)
                    .await?
                    .ok_or_else(|| CoreError::Conflict("duplicate job key".to_string()))?;
                return Ok(CreateOutcome::Duplicate(winner.id));
            }
            Err(err) => return Err(err.into()),
        };

        Self::insert_event(&mut tx, job.id, None, JobStatus::Queued, None).await?;

        sqlx::query(
            r#"
            INSERT INTO outbox (job_id, task_name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(job.id)
        .bind(&outbox.task_name)
        .bind(&outbox.payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreateOutcome::Created(job))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, CoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_by_job_key(&self, job_key: &str) -> Result<Option<Job>, CoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE job_key = $1"
        ))
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn latest_event(&self, job_id: Uuid) -> Result<Option<JobEvent>, CoreError> {
        let event = sqlx::query_as::<_, JobEvent>(
            r#"
            SELECT id, job_id, ts, prev_status, next_status, detail
            FROM job_event
            WHERE job_id = $1
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, CoreError> {
        let events = sqlx::query_as::<_, JobEvent>(
            r#"
            SELECT id, job_id, ts, prev_status, next_status, detail
            FROM job_event
            WHERE job_id = $1
            ORDER BY ts ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, CoreError> {
        let mut tx = self.pool.begin().await?;

        let job = Self::fetch_job_for_update(&mut tx, job_id).await?;

        if !job.status.can_transition_to(transition.next) {
            return Err(CoreError::InvalidStateTransition {
                from: job.status,
                to: transition.next,
            });
        }

        let now = Utc::now();
        let prev_status = job.status;
        let next = transition.next;

        let started_at = if next == JobStatus::Running {
            job.started_at.or(Some(now))
        } else {
            job.started_at
        };
        let finished_at = if next.is_terminal() { Some(now) } else { None };
        let attempt = if prev_status == JobStatus::Failed
            && matches!(next, JobStatus::Queued | JobStatus::DeadLetter)
        {
            job.attempt + 1
        } else {
            job.attempt
        };
        let error_code = transition.error_code.or(job.last_error_code);
        let error_message = transition
            .error_message
            .as_deref()
            .map(truncate_error)
            .or(job.last_error_message);

        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE job
            SET status = $1, attempt = $2, started_at = $3, finished_at = $4,
                last_error_code = $5, last_error_message = $6, updated_at = NOW()
            WHERE id = $7
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(next)
        .bind(attempt)
        .bind(started_at)
        .bind(finished_at)
        .bind(&error_code)
        .bind(&error_message)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_event(&mut tx, job_id, Some(prev_status), next, transition.detail).await?;

        tx.commit().await?;

        Ok(updated)
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        detail: EventDetail,
        emit_event: bool,
    ) -> Result<(), CoreError> {
        if detail.is_empty() {
            return Err(CoreError::Validation(
                "progress update requires non-empty detail".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let job = Self::fetch_job_for_update(&mut tx, job_id).await?;

        sqlx::query("UPDATE job SET updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        if emit_event {
            Self::insert_event(
                &mut tx,
                job_id,
                Some(job.status),
                job.status,
                Some(detail.into_value()),
            )
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn begin_dispatch(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let messages = sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        Ok(Box::new(PgOutboxClaim { tx, messages }))
    }

    async fn outbox_for_job(&self, job_id: Uuid) -> Result<Vec<OutboxMessage>, CoreError> {
        let messages = sqlx::query_as::<_, OutboxMessage>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE job_id = $1 ORDER BY created_at ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }
}

/// Claimed rows plus the transaction holding their locks. Dropping the claim
/// rolls the transaction back and the rows stay pending for the next tick.
struct PgOutboxClaim {
    tx: Transaction<'static, Postgres>,
    messages: Vec<OutboxMessage>,
}

#[async_trait]
impl OutboxClaim for PgOutboxClaim {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    async fn mark_sent(&mut self, outbox_id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE outbox SET sent_at = NOW() WHERE id = $1 AND sent_at IS NULL")
            .bind(outbox_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn mark_failed(&mut self, outbox_id: i64, error: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET fail_count = fail_count + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(outbox_id)
        .bind(truncate_error(error))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
