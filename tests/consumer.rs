//! Task queue consumer loop against an in-memory queue

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use common::wait_until;
use workload_worker::config::QueueConfig;
use workload_worker::messaging::{
    DispatchOutcome, ExecutorDispatcher, QueueError, TaskDispatcher, TaskQueueConsumer,
};
use workload_worker::test_helpers::services::stateless_service;
use workload_worker::test_helpers::{Harness, MemoryQueue};
use workload_worker::{ServiceStatus, Task, TaskExecutor, TaskMessage};

const TOPIC: &str = "worker";

/// Dispatcher answering with a fixed outcome and remembering what it saw
struct RecordingDispatcher {
    outcome: DispatchOutcome,
    seen: Mutex<Vec<Task>>,
}

impl RecordingDispatcher {
    fn new(outcome: DispatchOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Task> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: Task) -> DispatchOutcome {
        self.seen.lock().push(task);
        self.outcome
    }
}

/// Dispatcher that notes how many messages were unacknowledged while it ran
struct InFlightRecorder {
    queue: Arc<MemoryQueue>,
    observed: Mutex<Vec<usize>>,
}

#[async_trait]
impl TaskDispatcher for InFlightRecorder {
    async fn dispatch(&self, _task: Task) -> DispatchOutcome {
        self.observed.lock().push(self.queue.in_flight());
        DispatchOutcome::Handled
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        topic: TOPIC.to_string(),
        client_host: "test-worker".to_string(),
        ..QueueConfig::default()
    }
}

fn start_message(service_id: &str) -> TaskMessage {
    TaskMessage::new(
        "start",
        json!({"tenant_id": "tenant-1", "service_id": service_id, "event_id": "ev-1"}),
    )
    .with_user("operator")
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_decoded_and_dispatched() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::Handled);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));
    queue.push(TOPIC, start_message("svc-1"));
    queue.push(TOPIC, TaskMessage::new("apply_rule", json!({"rule": 1})));

    let handle = consumer.clone().start();
    let seen_by = dispatcher.clone();
    wait_until(|| seen_by.seen().len() == 2).await;
    consumer.stop();
    handle.await.unwrap();

    let seen = dispatcher.seen();
    assert_eq!(seen[0].event_id, "ev-1");
    assert_eq!(seen[0].user, "operator");
    assert_eq!(seen[0].body.service_id(), Some("svc-1"));
    assert_eq!(seen[1].kind(), None);

    let counters = consumer.counters();
    assert_eq!(counters.success(), 2);
    assert_eq!(counters.count_for("start"), 1);
    assert!(queue.enqueued().is_empty());
    assert_eq!(queue.acked().len(), 2);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_stays_in_flight_until_dispatched() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Arc::new(InFlightRecorder {
        queue: queue.clone(),
        observed: Mutex::new(Vec::new()),
    });
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));
    queue.push(TOPIC, start_message("svc-1"));

    let handle = consumer.clone().start();
    let acked_by = queue.clone();
    wait_until(|| acked_by.acked().len() == 1).await;
    consumer.stop();
    handle.await.unwrap();

    // Read but not removed while the task was being handed off
    assert_eq!(*dispatcher.observed.lock(), vec![1]);
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.pending(TOPIC), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_re_enqueue_leaves_message_unacknowledged() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::RetryRequested);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));
    queue.push_enqueue_error(QueueError::transport(TOPIC, "send", "connection reset"));
    queue.push(TOPIC, start_message("svc-1"));

    let handle = consumer.clone().start();
    let seen_by = dispatcher.clone();
    wait_until(|| seen_by.seen().len() == 1).await;
    consumer.stop();
    handle.await.unwrap();

    // Redelivered by the queue once its visibility timeout lapses
    assert!(queue.enqueued().is_empty());
    assert!(queue.acked().is_empty());
    assert_eq!(queue.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_requested_re_enqueues_original_message() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::RetryRequested);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));
    let message = start_message("svc-1");
    queue.push(TOPIC, message.clone());

    let handle = consumer.clone().start();
    let enqueued_to = queue.clone();
    wait_until(|| !enqueued_to.enqueued().is_empty()).await;
    consumer.stop();
    handle.await.unwrap();

    let (topic, requeued) = queue.enqueued().remove(0);
    assert_eq!(topic, TOPIC);
    assert_eq!(requeued, message);
    assert!(consumer.counters().retried() >= 1);
    assert_eq!(consumer.counters().success(), 0);
    assert!(!queue.acked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_queue_keeps_polling() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::Handled);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));

    let handle = consumer.clone().start();
    let polled = queue.clone();
    wait_until(|| polled.dequeue_calls() >= 2).await;

    // Deadline expiry is not an error
    assert!(consumer.health().healthy);

    queue.push(TOPIC, start_message("svc-1"));
    let seen_by = dispatcher.clone();
    wait_until(|| seen_by.seen().len() == 1).await;
    consumer.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_marks_unhealthy_and_backs_off() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::Handled);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher.clone(),
        queue_config(),
    ));
    queue.push_error(QueueError::transport(TOPIC, "read", "connection reset"));

    let handle = consumer.clone().start();
    let watched = consumer.clone();
    wait_until(|| !watched.health().healthy).await;

    let health = consumer.health();
    assert_eq!(health.consecutive_errors, 1);
    assert!(health.last_error.unwrap().contains("connection reset"));
    let calls_during_backoff = queue.dequeue_calls();

    // Recovers once the backoff has elapsed
    queue.push(TOPIC, start_message("svc-1"));
    let seen_by = dispatcher.clone();
    wait_until(|| seen_by.seen().len() == 1).await;
    assert!(queue.dequeue_calls() > calls_during_backoff);
    assert!(consumer.health().healthy);

    consumer.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_a_blocked_dequeue() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = RecordingDispatcher::new(DispatchOutcome::Handled);
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher,
        queue_config(),
    ));

    let handle = consumer.clone().start();
    let polled = queue.clone();
    wait_until(|| polled.dequeue_calls() >= 1).await;

    consumer.stop();
    tokio_test::assert_ok!(handle.await);
    assert!(consumer.cancellation_token().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_asks_for_retry() {
    let h = Harness::new();
    h.register(&stateless_service("svc-1", "web", 1));

    let queue = Arc::new(MemoryQueue::new());
    let executor = TaskExecutor::with_limit(0);
    let dispatcher = Arc::new(ExecutorDispatcher::new(
        executor.clone(),
        h.controller.clone(),
    ));
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher,
        queue_config(),
    ));
    queue.push(TOPIC, start_message("svc-1"));

    let handle = consumer.clone().start();
    let enqueued_to = queue.clone();
    wait_until(|| !enqueued_to.enqueued().is_empty()).await;
    consumer.stop();
    handle.await.unwrap();
    executor.stop().await;

    assert!(consumer.counters().retried() >= 1);
    assert!(h.orchestrator.workload_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dispatched_start_runs_to_completion() {
    let h = Harness::new();
    h.register(&stateless_service("svc-1", "web", 2));

    let queue = Arc::new(MemoryQueue::new());
    let executor = TaskExecutor::with_limit(4);
    let dispatcher = Arc::new(ExecutorDispatcher::new(
        executor.clone(),
        h.controller.clone(),
    ));
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher,
        queue_config(),
    ));
    queue.push(TOPIC, start_message("svc-1"));

    let handle = consumer.clone().start();
    let status = h.status.clone();
    wait_until(|| status.current("svc-1") == Some(ServiceStatus::Running)).await;
    consumer.stop();
    handle.await.unwrap();
    executor.stop().await;

    assert_eq!(consumer.counters().success(), 1);
    assert_eq!(h.store.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_task_without_handler_is_counted_as_ignored() {
    let h = Harness::new();
    h.register(&stateless_service("svc-1", "web", 1));

    let queue = Arc::new(MemoryQueue::new());
    let executor = TaskExecutor::with_limit(4);
    let dispatcher = Arc::new(ExecutorDispatcher::new(
        executor.clone(),
        h.controller.clone(),
    ));
    let consumer = Arc::new(TaskQueueConsumer::new(
        queue.clone(),
        dispatcher,
        queue_config(),
    ));
    queue.push(TOPIC, TaskMessage::new("apply_rule", json!({"rule": 1})));
    queue.push(TOPIC, start_message("svc-1"));

    let handle = consumer.clone().start();
    let status = h.status.clone();
    wait_until(|| status.current("svc-1") == Some(ServiceStatus::Running)).await;
    consumer.stop();
    handle.await.unwrap();
    executor.stop().await;

    let counters = consumer.counters();
    assert_eq!(counters.ignored(), 1);
    assert_eq!(counters.success(), 1);
    assert_eq!(counters.count_for("apply_rule"), 1);
    // Ignored messages are still removed from the queue
    assert_eq!(queue.acked().len(), 2);
}
