//! # Test Helpers
//!
//! In-memory stand-ins for the orchestrator, store, status service and queue,
//! plus fixtures. Shared by unit tests and the integration tests under
//! `tests/`.

pub mod orchestrator;
pub mod pods;
pub mod queue;
pub mod services;
pub mod status;
pub mod store;
pub mod workers;

use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::controller::WorkloadController;
use crate::logging::TaskLogger;
use crate::constants::labels;
use crate::models::{ServiceDesiredState, WorkloadKind};

pub use orchestrator::{FakeCall, FakeOrchestrator, PodBehavior};
pub use pods::PodState;
pub use queue::MemoryQueue;
pub use status::{MemoryStatusClient, StatusCall};
pub use store::MemoryStore;

/// Configuration with short rollout pauses
pub fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.rollout.step_interval_ms = 10;
    config
}

/// A controller wired to in-memory collaborators
pub struct Harness {
    pub orchestrator: Arc<FakeOrchestrator>,
    pub store: Arc<MemoryStore>,
    pub status: Arc<MemoryStatusClient>,
    pub controller: Arc<WorkloadController>,
    pub logger: TaskLogger,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeOrchestrator::new(), test_config())
    }

    pub fn with(orchestrator: FakeOrchestrator, config: WorkerConfig) -> Self {
        let orchestrator = Arc::new(orchestrator);
        let store = Arc::new(MemoryStore::new());
        let status = Arc::new(MemoryStatusClient::new());
        let controller = Arc::new(WorkloadController::new(
            orchestrator.clone(),
            store.clone(),
            status.clone(),
            &config,
        ));
        Self {
            orchestrator,
            store,
            status,
            controller,
            logger: TaskLogger::new("test-event"),
        }
    }

    /// Register a service with the store, labelled by its workload kind
    pub fn register(&self, service: &ServiceDesiredState) {
        self.store.insert_service(service.clone());
        if service.kind == WorkloadKind::Stateful {
            self.store
                .set_service_type(&service.service_id, labels::STATEFUL_SERVICE_TYPE);
        }
    }
}
