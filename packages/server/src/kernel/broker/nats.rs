//! NATS-backed broker adapter.
//!
//! Task messages are published as JSON to `tasks.{queue}` subjects; workers
//! join a queue-subscription group so each message lands on one consumer.
//! Core NATS settles on delivery, so `ack` is a no-op and `nack` republishes
//! the message to its subject.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::warn;

use crate::common::CoreError;
use crate::kernel::jobs::TaskMessage;

use super::{Acker, Broker, Delivery, Subscription};

const QUEUE_GROUP: &str = "conveyor-workers";

fn subject_for(queue: &str) -> String {
    format!("tasks.{queue}")
}

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| CoreError::Transient(format!("nats connect: {e}")))?;
        Ok(Self { client })
    }

    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| CoreError::Validation(format!("unserializable task message: {e}")))?;

        self.client
            .publish(subject_for(&message.queue_name), payload.into())
            .await
            .map_err(|e| CoreError::Transient(format!("nats publish: {e}")))?;

        // Surface connection-level failures now rather than on a later tick.
        self.client
            .flush()
            .await
            .map_err(|e| CoreError::Transient(format!("nats flush: {e}")))?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, CoreError> {
        let subject = subject_for(queue);
        let subscriber = self
            .client
            .queue_subscribe(subject.clone(), QUEUE_GROUP.to_string())
            .await
            .map_err(|e| CoreError::Transient(format!("nats subscribe: {e}")))?;

        Ok(Box::new(NatsSubscription {
            client: self.client.clone(),
            subject,
            subscriber,
        }))
    }

    async fn ping(&self) -> Result<(), CoreError> {
        self.client
            .flush()
            .await
            .map_err(|e| CoreError::Transient(format!("nats ping: {e}")))
    }
}

struct NatsSubscription {
    client: async_nats::Client,
    subject: String,
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let raw = self.subscriber.next().await?;
            match serde_json::from_slice::<TaskMessage>(&raw.payload) {
                Ok(message) => {
                    return Some(Delivery::new(
                        message,
                        Box::new(NatsAcker {
                            client: self.client.clone(),
                            subject: self.subject.clone(),
                            payload: raw.payload,
                        }),
                    ));
                }
                Err(e) => {
                    // A malformed payload can never become valid; drop it.
                    warn!(subject = %self.subject, error = %e, "discarding undecodable message");
                }
            }
        }
    }
}

struct NatsAcker {
    client: async_nats::Client,
    subject: String,
    payload: Bytes,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), CoreError> {
        self.client
            .publish(self.subject, self.payload)
            .await
            .map_err(|e| CoreError::Transient(format!("nats republish: {e}")))
    }
}
