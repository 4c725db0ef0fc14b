use async_trait::async_trait;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{TaskKind, WorkerKey};

/// Restart a service at its current deploy version
pub struct RestartTask {
    base: TaskBase,
}

impl RestartTask {
    pub fn new(base: TaskBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl TaskWorker for RestartTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Restart
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        self.base.resolve_service().await?;
        self.base.set_status(ServiceStatus::Upgrade).await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let service = self.base.service()?;
        let record = self
            .base
            .controller
            .store()
            .active_record(&service.service_id)
            .await?;

        let Some(record) = record else {
            self.base
                .logger
                .info("Service is not deployed, starting it", "restart", "running");
            self.base.set_status(ServiceStatus::Starting).await;
            return self.base.start(service).await;
        };

        self.base.restart_record(service, &record).await
    }

    async fn run_success(&self) {
        self.base.settle_status(ServiceStatus::Running).await;
        self.base
            .logger
            .info("Service restarted", "restart", "success");
    }

    async fn run_error(&self, err: &WorkerError) {
        self.base.handle_error(err).await;
    }

    async fn stop(&self) -> Result<()> {
        self.base.cancel();
        Ok(())
    }

    async fn roll_back(&self) {
        // Stops the rollout at the next step; both generations stay live
        self.base.cancel();
    }
}
