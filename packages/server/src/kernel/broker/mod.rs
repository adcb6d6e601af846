//! Broker adapter: the message transport between the outbox dispatcher and
//! the worker runtime.
//!
//! The surface is deliberately thin (publish, subscribe, ack/nack) so the
//! underlying transport can be swapped without touching other components.
//! Delivery is at-least-once; consumers must tolerate duplicates (the worker
//! runtime's terminal-state guard does).

mod memory;
mod nats;

use async_trait::async_trait;

use crate::common::CoreError;
use crate::kernel::jobs::TaskMessage;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

/// Message transport seam.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a task message. Any failure is treated as retryable by the
    /// dispatcher, which relies on outbox `fail_count` for surfaced alarms.
    async fn publish(&self, message: &TaskMessage) -> Result<(), CoreError>;

    /// Join the competing-consumer group for a queue.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, CoreError>;

    /// Reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), CoreError>;
}

/// A consumer's view of one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` when the transport shut down.
    async fn next(&mut self) -> Option<Delivery>;
}

/// One received message plus its acknowledgment handle.
pub struct Delivery {
    pub message: TaskMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: TaskMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    /// Settle the delivery; the broker will not redeliver it.
    pub async fn ack(self) -> Result<(), CoreError> {
        self.acker.ack().await
    }

    /// Return the message to the queue for redelivery.
    pub async fn nack(self) -> Result<(), CoreError> {
        self.acker.nack().await
    }
}

#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), CoreError>;
    async fn nack(self: Box<Self>) -> Result<(), CoreError>;
}
