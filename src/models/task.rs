//! # Task Model
//!
//! A task is one operator-issued lifecycle intent for one service. Tasks are
//! decoded from queue messages by their `task_type` discriminator; unknown
//! discriminators and undecodable bodies decode to [`TaskBody::Default`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::messaging::TaskMessage;

/// Closed set of task kinds this worker executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Start,
    Stop,
    Restart,
    HorizontalScaling,
    VerticalScaling,
    RollingUpgrade,
    Rollback,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::HorizontalScaling => "horizontal_scaling",
            Self::VerticalScaling => "vertical_scaling",
            Self::RollingUpgrade => "rolling_upgrade",
            Self::Rollback => "rollback",
        }
    }

    pub fn from_discriminator(task_type: &str) -> Option<Self> {
        match task_type {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "horizontal_scaling" => Some(Self::HorizontalScaling),
            "vertical_scaling" => Some(Self::VerticalScaling),
            "rolling_upgrade" => Some(Self::RollingUpgrade),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub deploy_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub deploy_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub deploy_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub strategy: Vec<String>,
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HorizontalScalingTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    pub replicas: i32,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub username: String,
}

/// New container limits; absent fields keep their stored value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerticalScalingTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub container_cpu: Option<i64>,
    #[serde(default)]
    pub container_memory: Option<i64>,
    #[serde(default)]
    pub container_gpu: Option<i64>,
    #[serde(default)]
    pub event_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingUpgradeTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    /// Deploy version the service is upgraded to
    #[serde(alias = "deploy_version")]
    pub new_deploy_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub strategy: Vec<String>,
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

/// Roll a service back to an earlier deploy version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackTaskBody {
    pub tenant_id: String,
    pub service_id: String,
    #[serde(default)]
    pub current_deploy_version: String,
    pub old_deploy_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub strategy: Vec<String>,
}

/// Decoded task body
#[derive(Debug, Clone, PartialEq)]
pub enum TaskBody {
    Start(StartTaskBody),
    Stop(StopTaskBody),
    Restart(RestartTaskBody),
    HorizontalScaling(HorizontalScalingTaskBody),
    VerticalScaling(VerticalScalingTaskBody),
    RollingUpgrade(RollingUpgradeTaskBody),
    Rollback(RollbackTaskBody),
    /// Unknown discriminator or undecodable body; ignored by the dispatcher
    Default(serde_json::Value),
}

impl TaskBody {
    pub fn kind(&self) -> Option<TaskKind> {
        match self {
            Self::Start(_) => Some(TaskKind::Start),
            Self::Stop(_) => Some(TaskKind::Stop),
            Self::Restart(_) => Some(TaskKind::Restart),
            Self::HorizontalScaling(_) => Some(TaskKind::HorizontalScaling),
            Self::VerticalScaling(_) => Some(TaskKind::VerticalScaling),
            Self::RollingUpgrade(_) => Some(TaskKind::RollingUpgrade),
            Self::Rollback(_) => Some(TaskKind::Rollback),
            Self::Default(_) => None,
        }
    }

    pub fn service_id(&self) -> Option<&str> {
        match self {
            Self::Start(b) => Some(&b.service_id),
            Self::Stop(b) => Some(&b.service_id),
            Self::Restart(b) => Some(&b.service_id),
            Self::HorizontalScaling(b) => Some(&b.service_id),
            Self::VerticalScaling(b) => Some(&b.service_id),
            Self::RollingUpgrade(b) => Some(&b.service_id),
            Self::Rollback(b) => Some(&b.service_id),
            Self::Default(_) => None,
        }
    }

    fn event_id(&self) -> Option<&str> {
        let event_id = match self {
            Self::Start(b) => &b.event_id,
            Self::Stop(b) => &b.event_id,
            Self::Restart(b) => &b.event_id,
            Self::HorizontalScaling(b) => &b.event_id,
            Self::VerticalScaling(b) => &b.event_id,
            Self::RollingUpgrade(b) => &b.event_id,
            Self::Rollback(b) => &b.event_id,
            Self::Default(_) => return None,
        };
        (!event_id.is_empty()).then_some(event_id.as_str())
    }
}

/// Identity of a registered worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub task_id: String,
    pub event_id: String,
}

impl WorkerKey {
    pub fn new(task_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.event_id)
    }
}

/// A decoded lifecycle task, immutable once dispatched
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub event_id: String,
    pub task_type: String,
    pub body: TaskBody,
    pub create_time: DateTime<Utc>,
    pub user: String,
}

impl Task {
    /// Decode a queue message by its discriminator
    pub fn from_message(message: &TaskMessage) -> Self {
        let body = Self::decode_body(&message.task_type, &message.task_body);
        let event_id = body
            .event_id()
            .map(str::to_string)
            .or_else(|| message.event_id.clone())
            .unwrap_or_default();

        Self {
            task_id: Uuid::new_v4().to_string(),
            event_id,
            task_type: message.task_type.clone(),
            body,
            create_time: message.create_time,
            user: message.user.clone(),
        }
    }

    fn decode_body(task_type: &str, raw: &serde_json::Value) -> TaskBody {
        let decoded = match TaskKind::from_discriminator(task_type) {
            Some(TaskKind::Start) => serde_json::from_value(raw.clone()).map(TaskBody::Start),
            Some(TaskKind::Stop) => serde_json::from_value(raw.clone()).map(TaskBody::Stop),
            Some(TaskKind::Restart) => serde_json::from_value(raw.clone()).map(TaskBody::Restart),
            Some(TaskKind::HorizontalScaling) => {
                serde_json::from_value(raw.clone()).map(TaskBody::HorizontalScaling)
            }
            Some(TaskKind::VerticalScaling) => {
                serde_json::from_value(raw.clone()).map(TaskBody::VerticalScaling)
            }
            Some(TaskKind::RollingUpgrade) => {
                serde_json::from_value(raw.clone()).map(TaskBody::RollingUpgrade)
            }
            Some(TaskKind::Rollback) => serde_json::from_value(raw.clone()).map(TaskBody::Rollback),
            None => return TaskBody::Default(raw.clone()),
        };

        decoded.unwrap_or_else(|e| {
            warn!(task_type = %task_type, error = %e, "Undecodable task body, treating as default");
            TaskBody::Default(raw.clone())
        })
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(self.task_id.clone(), self.event_id.clone())
    }

    pub fn kind(&self) -> Option<TaskKind> {
        self.body.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(task_type: &str, body: serde_json::Value) -> TaskMessage {
        TaskMessage {
            task_type: task_type.to_string(),
            task_body: body,
            create_time: Utc::now(),
            user: "admin".to_string(),
            event_id: None,
        }
    }

    #[test]
    fn test_decode_start_body() {
        let task = Task::from_message(&message(
            "start",
            json!({
                "tenant_id": "t1",
                "service_id": "s1",
                "deploy_version": "20240101",
                "event_id": "ev-1"
            }),
        ));

        assert_eq!(task.kind(), Some(TaskKind::Start));
        assert_eq!(task.event_id, "ev-1");
        assert_eq!(task.body.service_id(), Some("s1"));
        assert!(!task.task_id.is_empty());
    }

    #[test]
    fn test_unknown_discriminator_decodes_to_default() {
        let task = Task::from_message(&message("apply_rule", json!({"rule": 1})));
        assert_eq!(task.kind(), None);
        assert!(matches!(task.body, TaskBody::Default(_)));
    }

    #[test]
    fn test_undecodable_body_decodes_to_default() {
        let task = Task::from_message(&message("horizontal_scaling", json!({"service_id": 7})));
        assert!(matches!(task.body, TaskBody::Default(_)));
    }

    #[test]
    fn test_event_id_falls_back_to_message_metadata() {
        let mut msg = message(
            "stop",
            json!({"tenant_id": "t1", "service_id": "s1"}),
        );
        msg.event_id = Some("meta-ev".to_string());

        let task = Task::from_message(&msg);
        assert_eq!(task.event_id, "meta-ev");
        assert_eq!(task.key(), WorkerKey::new(task.task_id.clone(), "meta-ev"));
    }

    #[test]
    fn test_decode_vertical_scaling_and_rollback_bodies() {
        let task = Task::from_message(&message(
            "vertical_scaling",
            json!({"tenant_id": "t1", "service_id": "s1", "container_memory": 512, "event_id": "ev-2"}),
        ));
        assert_eq!(task.kind(), Some(TaskKind::VerticalScaling));
        assert_eq!(task.event_id, "ev-2");
        match task.body {
            TaskBody::VerticalScaling(body) => {
                assert_eq!(body.container_memory, Some(512));
                assert_eq!(body.container_cpu, None);
            }
            other => panic!("unexpected body {other:?}"),
        }

        let task = Task::from_message(&message(
            "rollback",
            json!({"tenant_id": "t1", "service_id": "s1", "old_deploy_version": "v1"}),
        ));
        assert_eq!(task.kind(), Some(TaskKind::Rollback));
        assert_eq!(task.body.service_id(), Some("s1"));
    }

    #[test]
    fn test_rolling_upgrade_accepts_deploy_version_alias() {
        let task = Task::from_message(&message(
            "rolling_upgrade",
            json!({"tenant_id": "t1", "service_id": "s1", "deploy_version": "v2"}),
        ));
        match task.body {
            TaskBody::RollingUpgrade(body) => assert_eq!(body.new_deploy_version, "v2"),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
