use async_trait::async_trait;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{TaskKind, WorkerKey};

/// Stop a service and remove everything it owns in the cluster
pub struct StopTask {
    base: TaskBase,
}

impl StopTask {
    pub fn new(base: TaskBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl TaskWorker for StopTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Stop
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        self.base.resolve_service().await?;
        self.base.set_status(ServiceStatus::Stopping).await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let service = self.base.service()?;
        match self
            .base
            .controller
            .stop_service(service, self.base.timeout_policy(), &self.base.logger)
            .await
        {
            Err(e) if e.is_not_deployed() => Ok(()),
            other => other,
        }
    }

    async fn run_success(&self) {
        self.base.set_status(ServiceStatus::Closed).await;
    }

    async fn run_error(&self, err: &WorkerError) {
        self.base.handle_error(err).await;
    }

    async fn stop(&self) -> Result<()> {
        self.base.cancel();
        Ok(())
    }

    async fn roll_back(&self) {
        // A half-stopped service cannot be restored; let the status service report it
        self.base.cancel();
        self.base.check_status().await;
    }
}
