//! # Worker Error Types
//!
//! Typed errors for task execution. Callers match on variants, never on the
//! rendered message.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::database::StoreError;
use crate::messaging::QueueError;
use crate::orchestrator::OrchestratorError;
use crate::readiness::ReadinessError;
use crate::status::StatusError;

/// Errors surfaced by task workers and the workload controller
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{operation} timed out after {seconds}s")]
    TimedOut { operation: String, seconds: u64 },

    #[error("service {service_id} has no active workload")]
    NotDeployed { service_id: String },

    #[error("service {service_id} is already deployed")]
    AlreadyDeployed { service_id: String },

    #[error("container {container} in pod {pod} terminated with error")]
    CrashLoop { pod: String, container: String },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("image {image} is not admitted, expected prefix {prefix}")]
    InvalidImage { image: String, prefix: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl WorkerError {
    /// Create a timeout error for a named wait
    pub fn timed_out(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            seconds: timeout.as_secs(),
        }
    }

    pub fn not_deployed(service_id: impl Into<String>) -> Self {
        Self::NotDeployed {
            service_id: service_id.into(),
        }
    }

    pub fn already_deployed(service_id: impl Into<String>) -> Self {
        Self::AlreadyDeployed {
            service_id: service_id.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_not_deployed(&self) -> bool {
        matches!(self, Self::NotDeployed { .. })
    }
}

impl From<ReadinessError> for WorkerError {
    fn from(err: ReadinessError) -> Self {
        match err {
            ReadinessError::CrashLoop { pod, container, .. } => Self::CrashLoop { pod, container },
        }
    }
}

/// Result type for task execution
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_helper() {
        let err = WorkerError::timed_out("scale up web", Duration::from_secs(120));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "scale up web timed out after 120s");
    }

    #[test]
    fn test_readiness_conversion() {
        let err: WorkerError = ReadinessError::CrashLoop {
            pod: "web-0".to_string(),
            container: "app".to_string(),
            message: Some("exit 1".to_string()),
        }
        .into();

        assert!(matches!(
            err,
            WorkerError::CrashLoop { ref pod, ref container } if pod == "web-0" && container == "app"
        ));
    }

    #[test]
    fn test_orchestrator_not_found_is_transparent() {
        let err: WorkerError = OrchestratorError::not_found("ReplicationController", "web").into();
        assert!(matches!(err, WorkerError::Orchestrator(ref e) if e.is_not_found()));
        assert!(!err.is_not_deployed());
    }
}
