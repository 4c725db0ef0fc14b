//! # Messaging
//!
//! Queue transport used by the task consumer. [`PgmqQueueClient`] is backed
//! by pgmq; tests use an in-memory queue.

pub mod consumer;
pub mod errors;
pub mod message;
pub mod pgmq_client;

use async_trait::async_trait;
use std::time::Duration;

pub use consumer::{
    DispatchOutcome, ExecutorDispatcher, QueueHealth, TaskCounters, TaskDispatcher,
    TaskQueueConsumer,
};
pub use errors::{QueueError, QueueResult};
pub use message::{QueuedMessage, TaskMessage};
pub use pgmq_client::PgmqQueueClient;

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Block until a message arrives on `topic` or `deadline` passes.
    ///
    /// The message is hidden from other consumers, not removed; it comes
    /// back unless [`ack`](Self::ack) is called in time.
    async fn dequeue(
        &self,
        topic: &str,
        client_host: &str,
        deadline: Duration,
    ) -> QueueResult<QueuedMessage>;

    /// Remove a dequeued message for good
    async fn ack(&self, topic: &str, msg_id: i64) -> QueueResult<()>;

    async fn enqueue(&self, topic: &str, message: &TaskMessage) -> QueueResult<()>;
}
