//! # Task Execution
//!
//! The bounded worker pool that runs task state machines concurrently.

pub mod worker_pool;

pub use worker_pool::{ExecutorError, TaskExecutor, WorkerStatus};
