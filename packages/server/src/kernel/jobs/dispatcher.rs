//! Outbox dispatcher: drains pending rows to the broker.
//!
//! Runs in the same process as ingest. Each tick claims unsent rows with
//! skip-locked semantics (concurrent dispatchers partition the backlog),
//! publishes them, and records delivery or failure before committing the
//! claim. A crash mid-tick rolls the claim back and the rows stay pending.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::CoreError;
use crate::kernel::broker::Broker;

use super::outbox::TaskMessage;
use super::store::JobStore;

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Tick period.
    pub interval: Duration,
    /// Maximum rows claimed per tick.
    pub batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

/// Background loop that publishes pending outbox rows.
pub struct OutboxDispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Claim and publish one batch. Returns `(sent, failed)` counts.
    ///
    /// Publish failures are recorded per row (`fail_count`, truncated
    /// `last_error`) and never block the rest of the batch.
    pub async fn dispatch_once(&self) -> Result<(usize, usize), CoreError> {
        let mut claim = self.store.begin_dispatch(self.config.batch_size).await?;
        let messages = claim.messages().to_vec();

        let mut sent = 0;
        let mut failed = 0;

        for row in &messages {
            let message = match TaskMessage::from_outbox(row) {
                Ok(message) => message,
                Err(e) => {
                    // An unparsable payload will never publish; record and move on.
                    warn!(outbox_id = row.id, job_id = %row.job_id, error = %e, "malformed outbox payload");
                    claim
                        .mark_failed(row.id, &format!("malformed payload: {e}"))
                        .await?;
                    failed += 1;
                    continue;
                }
            };

            match self.broker.publish(&message).await {
                Ok(()) => {
                    claim.mark_sent(row.id).await?;
                    sent += 1;
                }
                Err(e) => {
                    warn!(outbox_id = row.id, job_id = %row.job_id, error = %e, "broker publish failed");
                    claim.mark_failed(row.id, &e.to_string()).await?;
                    failed += 1;
                }
            }
        }

        claim.commit().await?;

        if sent > 0 || failed > 0 {
            debug!(sent, failed, "outbox batch dispatched");
        }

        Ok((sent, failed))
    }

    /// Run until the stop signal fires. The in-flight tick always finishes;
    /// unacknowledged claims simply stay pending for the next dispatcher.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox dispatcher starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.dispatch_once().await {
                error!(error = %e, "outbox dispatch tick failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::broker::MemoryBroker;
    use crate::kernel::jobs::ingest::{IngestService, OperationCatalog, SubmitRequest};
    use crate::kernel::jobs::testing::MemoryJobStore;
    use serde_json::json;
    use uuid::Uuid;

    fn harness() -> (Arc<MemoryJobStore>, Arc<MemoryBroker>, IngestService, OutboxDispatcher) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let ingest = IngestService::new(
            store.clone() as Arc<dyn JobStore>,
            OperationCatalog::standard(),
            3,
        );
        let dispatcher = OutboxDispatcher::new(
            store.clone() as Arc<dyn JobStore>,
            broker.clone() as Arc<dyn Broker>,
        );
        (store, broker, ingest, dispatcher)
    }

    fn mock_payload() -> serde_json::Map<String, serde_json::Value> {
        json!({"stage": "a"}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn dispatch_marks_rows_sent_exactly_once() {
        let (store, broker, ingest, dispatcher) = harness();
        let job_id = ingest
            .submit(Uuid::new_v4(), None, SubmitRequest::new("mock", mock_payload()))
            .await
            .unwrap()
            .job_id();

        let (sent, failed) = dispatcher.dispatch_once().await.unwrap();
        assert_eq!((sent, failed), (1, 0));

        let rows = store.outbox_for_job(job_id).await.unwrap();
        let first_sent_at = rows[0].sent_at.expect("sent_at stamped");

        // A second tick finds nothing and never re-stamps.
        let (sent, failed) = dispatcher.dispatch_once().await.unwrap();
        assert_eq!((sent, failed), (0, 0));
        let rows = store.outbox_for_job(job_id).await.unwrap();
        assert_eq!(rows[0].sent_at, Some(first_sent_at));

        // Exactly one broker message.
        let mut sub = broker.subscribe("default").await.unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.message.job_id(), Some(job_id));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn publish_failure_increments_fail_count_and_keeps_row() {
        let (store, broker, ingest, dispatcher) = harness();
        let job_id = ingest
            .submit(Uuid::new_v4(), None, SubmitRequest::new("mock", mock_payload()))
            .await
            .unwrap()
            .job_id();

        broker.set_fail_publishes(true);
        let (sent, failed) = dispatcher.dispatch_once().await.unwrap();
        assert_eq!((sent, failed), (0, 1));

        let rows = store.outbox_for_job(job_id).await.unwrap();
        assert!(rows[0].sent_at.is_none());
        assert_eq!(rows[0].fail_count, 1);
        assert!(rows[0].last_error.as_deref().unwrap().contains("injected"));

        // Recovery: the next tick delivers.
        broker.set_fail_publishes(false);
        let (sent, _) = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(sent, 1);
        let rows = store.outbox_for_job(job_id).await.unwrap();
        assert!(rows[0].sent_at.is_some());
        assert_eq!(rows[0].fail_count, 1);
    }

    #[tokio::test]
    async fn concurrent_dispatchers_never_double_publish() {
        let (store, broker, ingest, dispatcher_a) = harness();
        let dispatcher_b = OutboxDispatcher::new(
            store.clone() as Arc<dyn JobStore>,
            broker.clone() as Arc<dyn Broker>,
        );

        let mut job_ids = Vec::new();
        for n in 0..3 {
            let payload = json!({"n": n}).as_object().cloned().unwrap();
            job_ids.push(
                ingest
                    .submit(Uuid::new_v4(), None, SubmitRequest::new("mock", payload))
                    .await
                    .unwrap()
                    .job_id(),
            );
        }

        let (a, b) = tokio::join!(dispatcher_a.dispatch_once(), dispatcher_b.dispatch_once());
        let (sent_a, _) = a.unwrap();
        let (sent_b, _) = b.unwrap();
        assert_eq!(sent_a + sent_b, 3, "each row published by exactly one dispatcher");

        // Exactly three messages on the wire, one per job.
        let mut sub = broker.subscribe("default").await.unwrap();
        let mut delivered = Vec::new();
        for _ in 0..3 {
            let delivery = sub.next().await.unwrap();
            delivered.push(delivery.message.job_id().unwrap());
            delivery.ack().await.unwrap();
        }
        delivered.sort();
        job_ids.sort();
        assert_eq!(delivered, job_ids);

        for job_id in job_ids {
            let rows = store.outbox_for_job(job_id).await.unwrap();
            assert!(rows[0].sent_at.is_some());
        }
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let (_store, _broker, _ingest, dispatcher) = harness();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher exits after cancellation")
            .unwrap();
    }
}
