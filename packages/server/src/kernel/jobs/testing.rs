//! In-memory job store for tests.
//!
//! Mirrors the transactional semantics of the Postgres store: creation is
//! all-or-nothing, transitions serialize behind one lock, and outbox claims
//! hold rows exclusively until committed or dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::common::CoreError;

use super::events::{EventDetail, JobEvent};
use super::job::{truncate_error, Job, JobStatus, NewJob, Transition};
use super::outbox::{NewOutboxMessage, OutboxMessage};
use super::store::{CreateOutcome, JobStore, OutboxClaim};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    by_job_key: HashMap<String, Uuid>,
    by_org_idempotency: HashMap<(Uuid, String), Uuid>,
    events: Vec<JobEvent>,
    outbox: Vec<OutboxMessage>,
    next_outbox_id: i64,
    claimed: HashSet<i64>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    fail_next_create: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_with_outbox` fail before anything is written,
    /// simulating a crash ahead of the ingest commit.
    pub fn induce_create_failure(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn create_with_outbox(
        &self,
        new: NewJob,
        outbox: NewOutboxMessage,
    ) -> Result<CreateOutcome, CoreError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(CoreError::Transient("injected crash before commit".to_string()));
        }

        let mut state = self.state.lock().expect("store lock");

        if let Some(existing) = state.by_job_key.get(&new.job_key) {
            return Ok(CreateOutcome::Duplicate(*existing));
        }
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = state.by_org_idempotency.get(&(new.org_id, key.clone())) {
                return Ok(CreateOutcome::Duplicate(*existing));
            }
        }

        let now = Utc::now();
        let job = Job {
            id: new.id,
            org_id: new.org_id,
            job_type: new.job_type,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: new.max_attempts,
            backoff: new.backoff,
            priority: new.priority,
            job_key: new.job_key.clone(),
            idempotency_key: new.idempotency_key.clone(),
            requested_by: new.requested_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_error_code: None,
            last_error_message: None,
        };

        state.by_job_key.insert(new.job_key, job.id);
        if let Some(key) = new.idempotency_key {
            state.by_org_idempotency.insert((new.org_id, key), job.id);
        }
        state.events.push(JobEvent {
            id: Uuid::new_v4(),
            job_id: job.id,
            ts: now,
            prev_status: None,
            next_status: JobStatus::Queued,
            detail: None,
        });
        state.next_outbox_id += 1;
        let outbox_id = state.next_outbox_id;
        state.outbox.push(OutboxMessage {
            id: outbox_id,
            job_id: job.id,
            task_name: outbox.task_name,
            payload: outbox.payload,
            sent_at: None,
            fail_count: 0,
            last_error: None,
            created_at: now,
        });
        state.jobs.insert(job.id, job.clone());

        Ok(CreateOutcome::Created(job))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn find_by_job_key(&self, job_key: &str) -> Result<Option<Job>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .by_job_key
            .get(job_key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn latest_event(&self, job_id: Uuid) -> Result<Option<JobEvent>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .events
            .iter()
            .rev()
            .find(|e| e.job_id == job_id)
            .cloned())
    }

    async fn events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, CoreError> {
        let mut state = self.state.lock().expect("store lock");

        let job = state.jobs.get(&job_id).ok_or(CoreError::NotFound)?.clone();

        if !job.status.can_transition_to(transition.next) {
            return Err(CoreError::InvalidStateTransition {
                from: job.status,
                to: transition.next,
            });
        }

        let now = Utc::now();
        let prev_status = job.status;
        let next = transition.next;

        let mut updated = job;
        updated.status = next;
        updated.updated_at = now;
        if next == JobStatus::Running {
            updated.started_at = updated.started_at.or(Some(now));
        }
        updated.finished_at = if next.is_terminal() { Some(now) } else { None };
        if prev_status == JobStatus::Failed
            && matches!(next, JobStatus::Queued | JobStatus::DeadLetter)
        {
            updated.attempt += 1;
        }
        if let Some(code) = transition.error_code {
            updated.last_error_code = Some(code);
        }
        if let Some(message) = &transition.error_message {
            updated.last_error_message = Some(truncate_error(message));
        }

        state.events.push(JobEvent {
            id: Uuid::new_v4(),
            job_id,
            ts: now,
            prev_status: Some(prev_status),
            next_status: next,
            detail: transition.detail,
        });
        state.jobs.insert(job_id, updated.clone());

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

        let mut state = self.state.lock().expect("store lock");
        let status = state
            .jobs
            .get(&job_id)
            .ok_or(CoreError::NotFound)?
            .status;

        let now = Utc::now();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.updated_at = now;
        }
        if emit_event {
            state.events.push(JobEvent {
                id: Uuid::new_v4(),
                job_id,
                ts: now,
                prev_status: Some(status),
                next_status: status,
                detail: Some(detail.into_value()),
            });
        }

        Ok(())
    }

    async fn begin_dispatch(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, CoreError> {
        let mut state = self.state.lock().expect("store lock");

        let mut messages: Vec<OutboxMessage> = state
            .outbox
            .iter()
            .filter(|m| m.sent_at.is_none() && !state.claimed.contains(&m.id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages.truncate(limit.max(0) as usize);

        for message in &messages {
            state.claimed.insert(message.id);
        }

        Ok(Box::new(MemoryOutboxClaim {
            state: Arc::clone(&self.state),
            messages,
            staged: Vec::new(),
            committed: false,
        }))
    }

    async fn outbox_for_job(&self, job_id: Uuid) -> Result<Vec<OutboxMessage>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.job_id == job_id)
            .cloned()
            .collect())
    }
}

enum Staged {
    Sent(i64),
    Failed(i64, String),
}

struct MemoryOutboxClaim {
    state: Arc<Mutex<MemoryState>>,
    messages: Vec<OutboxMessage>,
    staged: Vec<Staged>,
    committed: bool,
}

#[async_trait]
impl OutboxClaim for MemoryOutboxClaim {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    async fn mark_sent(&mut self, outbox_id: i64) -> Result<(), CoreError> {
        self.staged.push(Staged::Sent(outbox_id));
        Ok(())
    }

    async fn mark_failed(&mut self, outbox_id: i64, error: &str) -> Result<(), CoreError> {
        self.staged
            .push(Staged::Failed(outbox_id, truncate_error(error)));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("store lock");
        let now = Utc::now();

        for staged in self.staged.drain(..) {
            match staged {
                Staged::Sent(id) => {
                    if let Some(row) = state.outbox.iter_mut().find(|m| m.id == id) {
                        if row.sent_at.is_none() {
                            row.sent_at = Some(now);
                        }
                    }
                }
                Staged::Failed(id, error) => {
                    if let Some(row) = state.outbox.iter_mut().find(|m| m.id == id) {
                        row.fail_count += 1;
                        row.last_error = Some(error);
                    }
                }
            }
        }
        for message in &self.messages {
            state.claimed.remove(&message.id);
        }
        self.committed = true;

        Ok(())
    }
}

impl Drop for MemoryOutboxClaim {
    fn drop(&mut self) {
        if !self.committed {
            // Rollback: staged updates are discarded, rows become pending.
            if let Ok(mut state) = self.state.lock() {
                for message in &self.messages {
                    state.claimed.remove(&message.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(org: Uuid) -> NewJob {
        NewJob::new(org, "mock", format!("key-{}", Uuid::new_v4()))
    }

    fn new_outbox() -> NewOutboxMessage {
        NewOutboxMessage {
            task_name: "process_mock".to_string(),
            payload: json!({"queue_name": "default", "args": [], "kwargs": {}, "options": {}}),
        }
    }

    #[tokio::test]
    async fn create_writes_job_event_and_outbox() {
        let store = MemoryJobStore::new();
        let outcome = store
            .create_with_outbox(new_job(Uuid::new_v4()), new_outbox())
            .await
            .unwrap();
        let job_id = outcome.job_id();
        assert!(outcome.is_created());

        let events = store.events(job_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prev_status, None);
        assert_eq!(events[0].next_status, JobStatus::Queued);
        assert_eq!(store.outbox_for_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_job_key_returns_existing_id() {
        let store = MemoryJobStore::new();
        let org = Uuid::new_v4();
        let mut a = new_job(org);
        a.job_key = "same".to_string();
        let mut b = new_job(org);
        b.job_key = "same".to_string();

        let first = store.create_with_outbox(a, new_outbox()).await.unwrap();
        let second = store.create_with_outbox(b, new_outbox()).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(
            store.outbox_for_job(first.job_id()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn induced_failure_writes_nothing() {
        let store = MemoryJobStore::new();
        store.induce_create_failure();

        let new = new_job(Uuid::new_v4());
        let key = new.job_key.clone();
        let result = store.create_with_outbox(new, new_outbox()).await;

        assert!(result.is_err());
        assert!(store.find_by_job_key(&key).await.unwrap().is_none());
        let claim = store.begin_dispatch(10).await.unwrap();
        assert!(claim.messages().is_empty());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_mutates_nothing() {
        let store = MemoryJobStore::new();
        let outcome = store
            .create_with_outbox(new_job(Uuid::new_v4()), new_outbox())
            .await
            .unwrap();
        let job_id = outcome.job_id();

        let err = store
            .transition(job_id, Transition::to(JobStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(store.events(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_claim_leaves_rows_pending() {
        let store = MemoryJobStore::new();
        store
            .create_with_outbox(new_job(Uuid::new_v4()), new_outbox())
            .await
            .unwrap();

        {
            let mut claim = store.begin_dispatch(10).await.unwrap();
            assert_eq!(claim.messages().len(), 1);
            let id = claim.messages()[0].id;
            claim.mark_sent(id).await.unwrap();
            // dropped without commit
        }

        let claim = store.begin_dispatch(10).await.unwrap();
        assert_eq!(claim.messages().len(), 1, "row must still be pending");
    }

    #[tokio::test]
    async fn concurrent_claims_partition_rows() {
        let store = MemoryJobStore::new();
        for _ in 0..2 {
            store
                .create_with_outbox(new_job(Uuid::new_v4()), new_outbox())
                .await
                .unwrap();
        }

        let first = store.begin_dispatch(10).await.unwrap();
        let second = store.begin_dispatch(10).await.unwrap();
        assert_eq!(first.messages().len(), 2);
        assert_eq!(second.messages().len(), 0);
    }
}
