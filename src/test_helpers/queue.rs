//! In-memory queue with scriptable transport errors and explicit acknowledgement

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::messaging::{QueueClient, QueueError, QueueResult, QueuedMessage, TaskMessage};

#[derive(Default)]
struct QueueState {
    topics: HashMap<String, VecDeque<TaskMessage>>,
    errors: VecDeque<QueueError>,
    enqueue_errors: VecDeque<QueueError>,
    enqueued: Vec<(String, TaskMessage)>,
    in_flight: BTreeMap<i64, (String, TaskMessage)>,
    acked: Vec<i64>,
    next_msg_id: i64,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    dequeue_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a message available without recording it as enqueued
    pub fn push(&self, topic: &str, message: TaskMessage) {
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_one();
    }

    /// Return `error` from the next dequeue
    pub fn push_error(&self, error: QueueError) {
        self.state.lock().errors.push_back(error);
        self.notify.notify_one();
    }

    /// Fail the next enqueue with `error`
    pub fn push_enqueue_error(&self, error: QueueError) {
        self.state.lock().enqueue_errors.push_back(error);
    }

    /// Dequeued messages that were never acknowledged
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Ids passed to [`QueueClient::ack`], in order
    pub fn acked(&self) -> Vec<i64> {
        self.state.lock().acked.clone()
    }

    /// Messages sent through [`QueueClient::enqueue`]
    pub fn enqueued(&self) -> Vec<(String, TaskMessage)> {
        self.state.lock().enqueued.clone()
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, VecDeque::len)
    }

    pub fn dequeue_calls(&self) -> usize {
        self.dequeue_calls.load(Ordering::SeqCst)
    }

    fn try_take(&self, topic: &str) -> Option<QueueResult<QueuedMessage>> {
        let mut state = self.state.lock();
        if let Some(err) = state.errors.pop_front() {
            return Some(Err(err));
        }
        let message = state.topics.get_mut(topic)?.pop_front()?;
        state.next_msg_id += 1;
        let msg_id = state.next_msg_id;
        state
            .in_flight
            .insert(msg_id, (topic.to_string(), message.clone()));
        Some(Ok(QueuedMessage { msg_id, message }))
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn dequeue(
        &self,
        topic: &str,
        _client_host: &str,
        deadline: Duration,
    ) -> QueueResult<QueuedMessage> {
        self.dequeue_calls.fetch_add(1, Ordering::SeqCst);
        let expires = tokio::time::Instant::now() + deadline;

        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_take(topic) {
                return result;
            }
            if tokio::time::timeout_at(expires, notified).await.is_err() {
                return Err(QueueError::deadline_exceeded(topic));
            }
        }
    }

    async fn ack(&self, topic: &str, msg_id: i64) -> QueueResult<()> {
        let mut state = self.state.lock();
        let owned = state
            .in_flight
            .get(&msg_id)
            .is_some_and(|(owner, _)| owner == topic);
        if !owned {
            return Err(QueueError::transport(
                topic,
                "delete",
                format!("message {msg_id} is not in flight"),
            ));
        }
        state.in_flight.remove(&msg_id);
        state.acked.push(msg_id);
        Ok(())
    }

    async fn enqueue(&self, topic: &str, message: &TaskMessage) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(err) = state.enqueue_errors.pop_front() {
                return Err(err);
            }
            state.enqueued.push((topic.to_string(), message.clone()));
        }
        self.push(topic, message.clone());
        Ok(())
    }
}
