#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, StatefulSet in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Workload Worker
//!
//! Lifecycle worker for tenant service workloads on Kubernetes.
//!
//! ## Overview
//!
//! The worker consumes lifecycle tasks (start, stop, restart, horizontal and
//! vertical scaling, rolling upgrade and rollback) from a queue, resolves each service's desired
//! state from PostgreSQL and drives the cluster toward it, waiting on pod
//! readiness and publishing service status along the way.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Queue transport and the task consumer loop
//! - [`execution`] - Bounded task executor with per-task lifecycle hooks
//! - [`tasks`] - One worker per task type
//! - [`controller`] - Workload operations: start, stop, scale, rolling replacement
//! - [`readiness`] - Pod readiness tracking and scheduling failure detection
//! - [`orchestrator`] - Cluster API seam with the kube-backed implementation
//! - [`database`] - Service definitions and workload bookkeeping records
//! - [`status`] - Client for the status sync service
//! - [`config`] - YAML configuration with environment sections
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workload_worker::config::WorkerConfig;
//! use workload_worker::controller::WorkloadController;
//! use workload_worker::test_helpers::{FakeOrchestrator, MemoryStatusClient, MemoryStore};
//!
//! let config = WorkerConfig::default();
//! let controller = WorkloadController::new(
//!     Arc::new(FakeOrchestrator::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStatusClient::new()),
//!     &config,
//! );
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod database;
pub mod error;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod readiness;
pub mod status;
pub mod tasks;
pub mod test_helpers;

pub use config::{ConfigManager, TimeoutPolicy, WorkerConfig};
pub use constants::ServiceStatus;
pub use controller::{RolloutOrdering, RolloutOutcome, WorkloadController};
pub use error::{Result, WorkerError};
pub use execution::{ExecutorError, TaskExecutor, WorkerStatus};
pub use messaging::{DispatchOutcome, QueueClient, QueuedMessage, TaskMessage, TaskQueueConsumer};
pub use models::{ServiceDesiredState, Task, TaskKind, WorkerKey};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use tasks::{build_worker, TaskWorker};
