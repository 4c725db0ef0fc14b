use async_trait::async_trait;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::controller::RolloutOrdering;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{ResourceKind, TaskKind, WorkerKey};

/// Move a service to another deploy version.
///
/// Serves both upgrades and rollbacks; a rollback is an upgrade whose target
/// is an earlier version and must name one.
pub struct RollingUpgradeTask {
    base: TaskBase,
    target_deploy_version: String,
}

impl RollingUpgradeTask {
    pub fn new(base: TaskBase, target_deploy_version: String) -> Self {
        Self {
            base,
            target_deploy_version,
        }
    }
}

#[async_trait]
impl TaskWorker for RollingUpgradeTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        self.base.kind
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        if self.base.kind == TaskKind::Rollback && self.target_deploy_version.is_empty() {
            return Err(WorkerError::InvalidTask(
                "rollback names no deploy version".to_string(),
            ));
        }
        let version = self.target_deploy_version.clone();
        self.base
            .resolve_service_with(|service| {
                if !version.is_empty() {
                    service.deploy_version = version;
                }
            })
            .await?;
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
                .info("Service is not deployed, starting it", "upgrade", "running");
            self.base.set_status(ServiceStatus::Starting).await;
            return self.base.start(service).await;
        };

        match record.resource_kind {
            // No native rolling support for StatefulSets here
            ResourceKind::StatefulSet => self.base.replace_by_restart(service).await,
            ResourceKind::Deployment => Err(WorkerError::Unsupported(format!(
                "rolling upgrade of Deployment {}",
                record.resource_name
            ))),
            ResourceKind::ReplicationController => {
                self.base
                    .replace_by_rollout(service, RolloutOrdering::SurgeFirst)
                    .await
            }
        }
    }

    async fn run_success(&self) {
        self.base.settle_status(ServiceStatus::Running).await;
        let message = match self.base.kind {
            TaskKind::Rollback => format!("Service rolled back to {}", self.target_deploy_version),
            _ => format!("Service upgraded to {}", self.target_deploy_version),
        };
        self.base.logger.info(&message, self.base.kind.as_str(), "success");
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
