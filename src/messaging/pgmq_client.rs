//! # PostgreSQL Message Queue Client (pgmq-rs)

use async_trait::async_trait;
use pgmq::PGMQueue;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{QueueClient, QueueError, QueueResult, QueuedMessage, TaskMessage};

/// pgmq-rs based queue client
#[derive(Debug, Clone)]
pub struct PgmqQueueClient {
    pgmq: PGMQueue,
    poll_interval: Duration,
    visibility_timeout_seconds: i32,
}

impl PgmqQueueClient {
    /// Create a client sharing an existing connection pool
    pub async fn new_with_pool(
        pool: sqlx::PgPool,
        poll_interval: Duration,
        visibility_timeout_seconds: i32,
    ) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        info!(
            visibility_timeout_seconds,
            "✅ pgmq client created with shared pool"
        );
        Self {
            pgmq,
            poll_interval,
            visibility_timeout_seconds,
        }
    }

    /// Create queue if it doesn't exist
    pub async fn create_queue(&self, topic: &str) -> QueueResult<()> {
        self.pgmq
            .create(topic)
            .await
            .map_err(|e| QueueError::transport(topic, "create", e.to_string()))?;
        info!("✅ Queue ready: {}", topic);
        Ok(())
    }
}

#[async_trait]
impl QueueClient for PgmqQueueClient {
    async fn dequeue(
        &self,
        topic: &str,
        client_host: &str,
        deadline: Duration,
    ) -> QueueResult<QueuedMessage> {
        let expires_at = Instant::now() + deadline;

        loop {
            let read = self
                .pgmq
                .read::<TaskMessage>(topic, Some(self.visibility_timeout_seconds))
                .await
                .map_err(|e| QueueError::transport(topic, "read", e.to_string()))?;

            if let Some(message) = read {
                debug!(
                    topic = %topic,
                    client_host = %client_host,
                    msg_id = message.msg_id,
                    read_ct = message.read_ct,
                    "📨 Dequeued task message"
                );
                return Ok(QueuedMessage {
                    msg_id: message.msg_id,
                    message: message.message,
                });
            }

            let now = Instant::now();
            if now >= expires_at {
                return Err(QueueError::deadline_exceeded(topic));
            }
            tokio::time::sleep(self.poll_interval.min(expires_at - now)).await;
        }
    }

    async fn ack(&self, topic: &str, msg_id: i64) -> QueueResult<()> {
        let deleted = self
            .pgmq
            .delete(topic, msg_id)
            .await
            .map_err(|e| QueueError::transport(topic, "delete", e.to_string()))?;
        debug!(topic = %topic, msg_id = msg_id, deleted = deleted, "🗑️ Task message acknowledged");
        Ok(())
    }

    async fn enqueue(&self, topic: &str, message: &TaskMessage) -> QueueResult<()> {
        let msg_id = self
            .pgmq
            .send(topic, message)
            .await
            .map_err(|e| QueueError::transport(topic, "send", e.to_string()))?;
        debug!(topic = %topic, msg_id = msg_id, "📤 Task message enqueued");
        Ok(())
    }
}
