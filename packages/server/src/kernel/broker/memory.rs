//! In-process broker for tests and single-node development.
//!
//! Each queue is an unbounded channel shared by its subscribers (competing
//! consumers). `nack` re-enqueues the message, giving the same redelivery
//! semantics the worker runtime relies on in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::CoreError;
use crate::kernel::jobs::TaskMessage;

use super::{Acker, Broker, Delivery, Subscription};

struct QueueChannel {
    tx: mpsc::UnboundedSender<TaskMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskMessage>>>,
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueChannel>>,
    fail_publishes: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail, for exercising the dispatcher's
    /// failure bookkeeping.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    fn channel(&self, queue: &str) -> (mpsc::UnboundedSender<TaskMessage>, Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskMessage>>>) {
        let mut queues = self.queues.lock().expect("broker lock");
        let entry = queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueChannel {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (entry.tx.clone(), Arc::clone(&entry.rx))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<(), CoreError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(CoreError::Transient("injected publish failure".to_string()));
        }

        let (tx, _) = self.channel(&message.queue_name);
        tx.send(message.clone())
            .map_err(|_| CoreError::Transient("queue closed".to_string()))
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, CoreError> {
        let (tx, rx) = self.channel(queue);
        Ok(Box::new(MemorySubscription { tx, rx }))
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

struct MemorySubscription {
    tx: mpsc::UnboundedSender<TaskMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskMessage>>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let message = self.rx.lock().await.recv().await?;
        Some(Delivery::new(
            message.clone(),
            Box::new(MemoryAcker {
                tx: self.tx.clone(),
                message,
            }),
        ))
    }
}

struct MemoryAcker {
    tx: mpsc::UnboundedSender<TaskMessage>,
    message: TaskMessage,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), CoreError> {
        self.tx
            .send(self.message)
            .map_err(|_| CoreError::Transient("queue closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_then_consume() {
        let broker = MemoryBroker::new();
        let message = TaskMessage::new("default", "process_mock", Uuid::new_v4());
        broker.publish(&message).await.unwrap();

        let mut sub = broker.subscribe("default").await.unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.message.task_name, "process_mock");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_redelivers() {
        let broker = MemoryBroker::new();
        let message = TaskMessage::new("default", "process_mock", Uuid::new_v4());
        broker.publish(&message).await.unwrap();

        let mut sub = broker.subscribe("default").await.unwrap();
        let delivery = sub.next().await.unwrap();
        delivery.nack().await.unwrap();

        let redelivered = sub.next().await.unwrap();
        assert_eq!(redelivered.message.task_name, "process_mock");
    }

    #[tokio::test]
    async fn injected_failures_surface_as_transient() {
        let broker = MemoryBroker::new();
        broker.set_fail_publishes(true);
        let message = TaskMessage::new("default", "t", Uuid::new_v4());
        assert!(broker.publish(&message).await.is_err());

        broker.set_fail_publishes(false);
        assert!(broker.publish(&message).await.is_ok());
    }
}
