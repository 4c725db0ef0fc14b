use async_trait::async_trait;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{TaskKind, WorkerKey};

/// First start of a service.
///
/// Refuses to run over a live deployment: an active record with a status
/// other than closed means the service is already up.
pub struct StartTask {
    base: TaskBase,
}

impl StartTask {
    pub fn new(base: TaskBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl TaskWorker for StartTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Start
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        self.base.resolve_service().await?;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let service = self.base.service()?;
        let controller = &self.base.controller;

        if controller
            .store()
            .active_record(&service.service_id)
            .await?
            .is_some()
        {
            let status = controller.status().get_status(&service.service_id).await?;
            if !status.is_closed() {
                return Err(WorkerError::already_deployed(&service.service_id));
            }
            // Closed but still recorded: clear what a previous run left behind
            controller.tear_down(service, &self.base.logger).await?;
        }

        self.base.set_status(ServiceStatus::Starting).await;
        self.base.start(service).await
    }

    async fn run_success(&self) {
        self.base.settle_status(ServiceStatus::Running).await;
        self.base
            .logger
            .info("Service started", "start", "success");
    }

    async fn run_error(&self, err: &WorkerError) {
        self.base.handle_error(err).await;
    }

    async fn stop(&self) -> Result<()> {
        self.base.cancel();
        Ok(())
    }

    async fn roll_back(&self) {
        self.base.cancel();
        self.base.compensate_start().await;
    }
}
