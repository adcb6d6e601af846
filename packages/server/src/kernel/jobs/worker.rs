//! Worker runtime: consumes broker deliveries and drives the job ledger.
//!
//! The protocol per message:
//! 1. Terminal-state guard: a job already in a terminal status is acked and
//!    dropped; this is the primary defense against duplicate delivery.
//! 2. `queued -> running` under the job's row lock.
//! 3. Run the registered handler; it reports progress through [`JobContext`].
//! 4. Success: `running -> succeeded` with the result event; ack.
//! 5. Validation failure: `running -> failed` permanently; ack.
//! 6. Anything else: `running -> failed`, then either `failed -> dead_letter`
//!    (attempt budget exhausted; ack) or `failed -> queued` plus a backoff
//!    nack so the broker redelivers to any worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::CoreError;
use crate::kernel::broker::Delivery;
use crate::kernel::Kernel;

use super::events::EventDetail;
use super::job::{Job, JobStatus, Transition};
use super::registry::HandlerRegistry;

/// Configuration for the worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume.
    pub queue: String,
    /// Backoff floor between retries.
    pub min_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
    /// Attempt budget assumed for job rows without a positive one.
    pub max_retries: i32,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            min_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_retries: 3,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

/// Ledger access handed to handlers.
///
/// Progress events are same-status writes that always request an event, so
/// polling clients observe stage/progress through the latest-event
/// projection.
pub struct JobContext {
    kernel: Arc<Kernel>,
    job: Job,
}

impl JobContext {
    pub fn new(kernel: Arc<Kernel>, job: Job) -> Self {
        Self { kernel, job }
    }

    /// The job row as read when the delivery was accepted.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Re-read the job row, for handler-side idempotency checks.
    pub async fn refresh(&self) -> Result<Job, CoreError> {
        self.kernel
            .store
            .get_job(self.job.id)
            .await?
            .ok_or(CoreError::NotFound)
    }

    /// Emit a stage/progress event without changing status.
    pub async fn progress(&self, stage: &str, progress: i32) -> Result<(), CoreError> {
        self.kernel
            .store
            .record_progress(self.job.id, EventDetail::stage(stage, progress), true)
            .await
    }
}

/// Consumes task messages and executes registered handlers with
/// exactly-once-effect semantics against the ledger.
pub struct WorkerRuntime {
    kernel: Arc<Kernel>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl WorkerRuntime {
    pub fn new(kernel: Arc<Kernel>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            kernel,
            registry,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(
        kernel: Arc<Kernel>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            kernel,
            registry,
            config,
        }
    }

    /// Run until the stop signal fires. Deliveries are processed
    /// concurrently across jobs; per-job ordering is enforced by the
    /// ledger's row locks.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), CoreError> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            "worker runtime starting"
        );

        let mut subscription = self.kernel.broker.subscribe(&self.config.queue).await?;
        let mut inflight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };
                    let runtime = Arc::clone(&self);
                    inflight.spawn(async move {
                        runtime.handle_delivery(delivery).await;
                    });
                }
                // Reap finished handlers so the set stays bounded.
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        // Drain in-flight handlers before exiting.
        while inflight.join_next().await.is_some() {}

        info!(worker_id = %self.config.worker_id, "worker runtime stopped");
        Ok(())
    }

    /// Process one delivery end to end, settling it with the broker.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let message = delivery.message.clone();

        let Some(job_id) = message.job_id() else {
            warn!(task = %message.task_name, "dropping message without a job id");
            let _ = delivery.ack().await;
            return;
        };

        let job = match self.kernel.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "dropping message for unknown job");
                let _ = delivery.ack().await;
                return;
            }
            Err(e) => {
                // Ledger unreachable: leave the message with the broker.
                error!(job_id = %job_id, error = %e, "ledger read failed");
                let _ = delivery.nack().await;
                return;
            }
        };

        // Terminal-state guard.
        if job.status.is_terminal() {
            info!(job_id = %job_id, status = job.status.as_str(), "terminal-state guard: duplicate delivery dropped");
            let _ = delivery.ack().await;
            return;
        }

        // A concurrent consumer already owns this attempt.
        if job.status == JobStatus::Running {
            debug!(job_id = %job_id, "job already running; dropping duplicate delivery");
            let _ = delivery.ack().await;
            return;
        }

        let Some(handler) = self.registry.get(&message.task_name) else {
            // Startup validation makes this an operator error on this
            // instance; another worker may carry the handler.
            error!(job_id = %job_id, task = %message.task_name, "no handler registered");
            let _ = delivery.nack().await;
            return;
        };

        let running = match self
            .kernel
            .store
            .transition(job_id, Transition::to(JobStatus::Running))
            .await
        {
            Ok(job) => job,
            Err(CoreError::InvalidStateTransition { .. }) => {
                // Lost the claim race to another worker.
                debug!(job_id = %job_id, "claim race lost; dropping delivery");
                let _ = delivery.ack().await;
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to mark job running");
                let _ = delivery.nack().await;
                return;
            }
        };

        let ctx = JobContext::new(Arc::clone(&self.kernel), running.clone());
        let result = handler.run(&ctx, &message.args, &message.kwargs).await;

        match result {
            Ok(result) => {
                debug!(job_id = %job_id, task = %message.task_name, "job succeeded");
                let detail = EventDetail::result(result.unwrap_or_else(|| json!({})));
                if let Err(e) = self
                    .kernel
                    .store
                    .transition(
                        job_id,
                        Transition::to(JobStatus::Succeeded).with_detail(detail.into_value()),
                    )
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job succeeded");
                }
                let _ = delivery.ack().await;
            }
            Err(CoreError::Validation(reason)) => {
                // Permanent: retries cannot help; do not return it to the broker.
                warn!(job_id = %job_id, error = %reason, "job failed validation");
                if let Err(e) = self
                    .kernel
                    .store
                    .transition(
                        job_id,
                        Transition::to(JobStatus::Failed)
                            .with_error("VALIDATION_ERROR", reason.as_str())
                            .with_detail(EventDetail::error(reason.as_str()).into_value()),
                    )
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                }
                let _ = delivery.ack().await;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "job failed");
                self.fail_and_maybe_retry(delivery, &running, &err).await;
            }
        }
    }

    /// Retryable failure path: record the failure, then either dead-letter
    /// or requeue with backoff.
    async fn fail_and_maybe_retry(&self, delivery: Delivery, job: &Job, err: &CoreError) {
        let error_code = match err {
            CoreError::Transient(_) => "TRANSIENT",
            _ => "HANDLER_ERROR",
        };
        let message = err.to_string();

        let failed = match self
            .kernel
            .store
            .transition(
                job.id,
                Transition::to(JobStatus::Failed)
                    .with_error(error_code, message.as_str())
                    .with_detail(EventDetail::error(message.as_str()).into_value()),
            )
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark job failed");
                let _ = delivery.nack().await;
                return;
            }
        };

        let budget = if failed.max_attempts > 0 {
            failed.max_attempts
        } else {
            self.config.max_retries
        };
        if failed.attempt + 1 >= budget {
            info!(
                job_id = %job.id,
                attempt = failed.attempt + 1,
                max_attempts = budget,
                "attempts exhausted; dead-lettering"
            );
            if let Err(e) = self
                .kernel
                .store
                .transition(
                    job.id,
                    Transition::to(JobStatus::DeadLetter)
                        .with_detail(EventDetail::error(message.as_str()).into_value()),
                )
                .await
            {
                error!(job_id = %job.id, error = %e, "failed to dead-letter job");
            }
            let _ = delivery.ack().await;
            return;
        }

        let requeued = match self
            .kernel
            .store
            .transition(job.id, Transition::to(JobStatus::Queued))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to requeue job");
                let _ = delivery.nack().await;
                return;
            }
        };

        let delay_ms = requeued.backoff.delay_ms(
            requeued.attempt,
            self.config.min_backoff_ms,
            self.config.max_backoff_ms,
        );
        info!(job_id = %job.id, attempt = requeued.attempt, delay_ms, "retrying job");
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let _ = delivery.nack().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue, "default");
        assert!(config.worker_id.starts_with("worker-"));
    }
}
