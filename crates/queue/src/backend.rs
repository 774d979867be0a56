//! Queue backend abstraction.
//!
//! One named durable queue with manual acknowledgement. A received message
//! stays owned by this consumer until it is acked, nacked or dead-lettered;
//! if the consumer dies first the broker hands it to another consumer.

use async_trait::async_trait;
use mailverify_common::AppResult;
use std::sync::Arc;

/// A message received from the queue and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Delivery attempt, starting at 1 and increased on every requeue.
    pub attempt: u32,
}

/// Durable work queue with manual acknowledgement.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create the queue if it does not exist. Idempotent.
    async fn declare(&self) -> AppResult<()>;

    /// Append a message. Returns once the broker has durably accepted it.
    async fn publish(&self, body: &[u8]) -> AppResult<()>;

    /// Take the next message, or `None` if none arrived within the poll window.
    async fn receive(&self) -> AppResult<Option<Delivery>>;

    /// Settle a message as processed.
    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Settle a message as failed. With `requeue` it goes back on the queue
    /// with its attempt counter increased, otherwise it is dropped for good.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> AppResult<()>;

    /// Move a message to the dead-letter store.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;
}

/// Type alias for a shared queue backend.
pub type SharedQueue = Arc<dyn QueueBackend>;
