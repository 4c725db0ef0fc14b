//! Task message as carried on the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialized task. The body stays undecoded until dispatch so a retried
/// message can be re-enqueued exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_type: String,
    #[serde(default)]
    pub task_body: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl TaskMessage {
    pub fn new(task_type: impl Into<String>, task_body: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            task_body,
            create_time: Utc::now(),
            user: String::new(),
            event_id: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// A message read from the queue but not yet acknowledged. It becomes
/// visible to consumers again once the visibility timeout lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub msg_id: i64,
    pub message: TaskMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_payload_deserializes() {
        let msg: TaskMessage = serde_json::from_value(json!({
            "task_type": "stop",
            "task_body": {"service_id": "s1"}
        }))
        .unwrap();

        assert_eq!(msg.task_type, "stop");
        assert!(msg.user.is_empty());
        assert!(msg.event_id.is_none());
    }
}
