//! # Task Queue Consumer
//!
//! Single loop that pulls serialized lifecycle tasks off the queue, decodes
//! them and hands them to a [`TaskDispatcher`].
//!
//! - A dequeue that hits its deadline means no work; the loop retries at once.
//! - Cancellation ends the loop.
//! - Any other transport error is logged and the loop backs off.
//! - A `RetryRequested` dispatch re-enqueues the original message untouched.
//! - A message is acknowledged only once it was dispatched, or re-enqueued
//!   on retry. Anything left unacknowledged reappears after the visibility
//!   timeout, so a crash mid-dispatch loses no task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{QueueClient, QueueError, QueuedMessage};
use crate::config::QueueConfig;
use crate::controller::WorkloadController;
use crate::execution::{ExecutorError, TaskExecutor};
use crate::models::Task;
use crate::tasks::build_worker;

/// What became of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    HandledWithError,
    /// Put the original message back on the queue for a fresh attempt
    RetryRequested,
    /// No worker handles this task type
    Ignored,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: Task) -> DispatchOutcome;
}

/// Process-wide task counters, safe to read while the consumer updates them
#[derive(Debug, Default)]
pub struct TaskCounters {
    success: AtomicU64,
    error: AtomicU64,
    retried: AtomicU64,
    ignored: AtomicU64,
    by_type: DashMap<String, u64>,
}

impl TaskCounters {
    pub fn record(&self, task_type: &str, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::HandledWithError => {
                self.error.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::RetryRequested => {
                self.error.fetch_add(1, Ordering::Relaxed);
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Ignored => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
        *self.by_type.entry(task_type.to_string()).or_insert(0) += 1;
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn count_for(&self, task_type: &str) -> u64 {
        self.by_type.get(task_type).map(|count| *count).unwrap_or(0)
    }
}

/// Health of the queue connection as seen by the last dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHealth {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for QueueHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_errors: 0,
            last_error: None,
            last_success: None,
        }
    }
}

pub struct TaskQueueConsumer {
    queue: Arc<dyn QueueClient>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: QueueConfig,
    cancel: CancellationToken,
    counters: Arc<TaskCounters>,
    health: Mutex<QueueHealth>,
}

impl TaskQueueConsumer {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            config,
            cancel: CancellationToken::new(),
            counters: Arc::new(TaskCounters::default()),
            health: Mutex::new(QueueHealth::default()),
        }
    }

    pub fn counters(&self) -> Arc<TaskCounters> {
        self.counters.clone()
    }

    pub fn health(&self) -> QueueHealth {
        self.health.lock().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the consume loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn stop(&self) {
        info!(topic = %self.config.topic, "Stopping task queue consumer");
        self.cancel.cancel();
    }

    #[instrument(skip(self), fields(topic = %self.config.topic))]
    pub async fn run(&self) {
        info!(client_host = %self.config.client_host, "Task queue consumer started");

        loop {
            let dequeued = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(QueueError::Canceled),
                result = self.queue.dequeue(
                    &self.config.topic,
                    &self.config.client_host,
                    self.config.dequeue_deadline(),
                ) => result,
            };

            match dequeued {
                Ok(message) => {
                    self.mark_success();
                    self.handle(message).await;
                }
                Err(QueueError::DeadlineExceeded { .. }) => {
                    self.mark_success();
                }
                Err(QueueError::Canceled) => break,
                Err(e) => {
                    error!(error = %e, "Dequeue failed");
                    self.mark_failure(&e);
                    if !self.pause(self.config.error_backoff()).await {
                        break;
                    }
                }
            }
        }

        info!(
            success = self.counters.success(),
            error = self.counters.error(),
            ignored = self.counters.ignored(),
            "Task queue consumer stopped"
        );
    }

    async fn handle(&self, queued: QueuedMessage) {
        let QueuedMessage { msg_id, message } = queued;
        let task = Task::from_message(&message);
        debug!(
            task_id = %task.task_id,
            event_id = %task.event_id,
            task_type = %task.task_type,
            "Task received"
        );

        let outcome = self.dispatcher.dispatch(task).await;
        self.counters.record(&message.task_type, outcome);

        let settled = if outcome == DispatchOutcome::RetryRequested {
            match self.queue.enqueue(&self.config.topic, &message).await {
                Ok(()) => {
                    info!(task_type = %message.task_type, "Task re-enqueued for retry");
                    true
                }
                Err(e) => {
                    error!(
                        task_type = %message.task_type,
                        msg_id = msg_id,
                        error = %e,
                        "Failed to re-enqueue task, leaving it for redelivery"
                    );
                    false
                }
            }
        } else {
            true
        };

        if settled {
            if let Err(e) = self.queue.ack(&self.config.topic, msg_id).await {
                warn!(msg_id = msg_id, error = %e, "Failed to acknowledge task message");
            }
        }

        if outcome == DispatchOutcome::RetryRequested {
            self.pause(self.config.retry_backoff()).await;
        }
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn mark_success(&self) {
        let mut health = self.health.lock();
        health.healthy = true;
        health.consecutive_errors = 0;
        health.last_success = Some(Utc::now());
    }

    fn mark_failure(&self, err: &QueueError) {
        let mut health = self.health.lock();
        health.healthy = false;
        health.consecutive_errors += 1;
        health.last_error = Some(err.to_string());
    }
}

/// Dispatcher that builds a worker per task and submits it to the executor.
///
/// A full pool or a shutting-down executor asks the consumer to retry.
pub struct ExecutorDispatcher {
    executor: TaskExecutor,
    controller: Arc<WorkloadController>,
}

impl ExecutorDispatcher {
    pub fn new(executor: TaskExecutor, controller: Arc<WorkloadController>) -> Self {
        Self {
            executor,
            controller,
        }
    }
}

#[async_trait]
impl TaskDispatcher for ExecutorDispatcher {
    async fn dispatch(&self, task: Task) -> DispatchOutcome {
        let Some(worker) = build_worker(&task, self.controller.clone()) else {
            warn!(task_type = %task.task_type, "Ignoring task without a handler");
            return DispatchOutcome::Ignored;
        };

        match self.executor.add_task(worker).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e @ (ExecutorError::PoolFull { .. } | ExecutorError::ShuttingDown)) => {
                warn!(task_id = %task.task_id, error = %e, "Task not admitted, requesting retry");
                DispatchOutcome::RetryRequested
            }
            Err(e @ ExecutorError::DuplicateWorker { .. }) => {
                error!(task_id = %task.task_id, error = %e, "Task rejected");
                DispatchOutcome::HandledWithError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_outcomes() {
        let counters = TaskCounters::default();
        counters.record("start", DispatchOutcome::Handled);
        counters.record("start", DispatchOutcome::Handled);
        counters.record("stop", DispatchOutcome::HandledWithError);
        counters.record("restart", DispatchOutcome::RetryRequested);
        counters.record("apply_rule", DispatchOutcome::Ignored);

        assert_eq!(counters.success(), 2);
        assert_eq!(counters.error(), 2);
        assert_eq!(counters.retried(), 1);
        assert_eq!(counters.ignored(), 1);
        assert_eq!(counters.count_for("apply_rule"), 1);
        assert_eq!(counters.count_for("start"), 2);
        assert_eq!(counters.count_for("horizontal_scaling"), 0);
    }

    #[test]
    fn test_health_starts_healthy() {
        let health = QueueHealth::default();
        assert!(health.healthy);
        assert_eq!(health.consecutive_errors, 0);
    }
}
