use async_trait::async_trait;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{ScaleMode, TaskKind, WorkerKey};

/// Change the replica count of the active workload
pub struct HorizontalScalingTask {
    base: TaskBase,
    replicas: i32,
}

impl HorizontalScalingTask {
    pub fn new(base: TaskBase, replicas: i32) -> Self {
        Self { base, replicas }
    }
}

#[async_trait]
impl TaskWorker for HorizontalScalingTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::HorizontalScaling
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(WorkerError::InvalidTask(format!(
                "replica count must not be negative, got {}",
                self.replicas
            )));
        }
        self.base.resolve_service().await?;
        // Scaling changes a live service, reported the same way as an upgrade
        self.base.set_status(ServiceStatus::Upgrade).await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let service = self.base.service()?;
        let scaled = self
            .base
            .controller
            .scale_service(service, self.replicas, &self.base.logger)
            .await;

        match scaled {
            Ok(Some(intent)) => {
                let step = match intent.mode {
                    ScaleMode::Up => "scale-up",
                    ScaleMode::Down => "scale-down",
                };
                self.base.logger.info(
                    &format!("Scaled to {} replicas", intent.target_replicas),
                    step,
                    "success",
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => self.base.tolerate_timeout(Err(e)),
        }
    }

    async fn run_success(&self) {
        self.base.settle_status(ServiceStatus::Running).await;
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
        self.base.check_status().await;
    }
}
