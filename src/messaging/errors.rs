//! # Queue Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// No message arrived before the dequeue deadline
    #[error("Dequeue deadline exceeded on {topic}")]
    DeadlineExceeded { topic: String },

    /// The consumer was shut down while waiting
    #[error("Queue operation canceled")]
    Canceled,

    #[error("Queue operation failed: {topic}: {operation}: {message}")]
    Transport {
        topic: String,
        operation: String,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },
}

impl QueueError {
    pub fn deadline_exceeded(topic: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            topic: topic.into(),
        }
    }

    pub fn transport(
        topic: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            topic: topic.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_helpers() {
        assert!(QueueError::deadline_exceeded("worker").is_deadline_exceeded());

        let err = QueueError::transport("worker", "pop", "connection reset");
        assert!(!err.is_deadline_exceeded());
        assert_eq!(
            err.to_string(),
            "Queue operation failed: worker: pop: connection reset"
        );
    }
}
