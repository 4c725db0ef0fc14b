use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use super::{TaskBase, TaskWorker};
use crate::constants::ServiceStatus;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{ResourceLimits, TaskKind, WorkerKey};

/// Change a service's container limits.
///
/// The new limits are saved first. A closed or undeployed service picks
/// them up on its next start; a running one is restarted with them.
pub struct VerticalScalingTask {
    base: TaskBase,
    cpu_millicores: Option<i64>,
    memory_mib: Option<i64>,
    gpu_count: Option<i64>,
    /// Limits were saved and nothing needs restarting
    saved_only: AtomicBool,
}

impl VerticalScalingTask {
    pub fn new(
        base: TaskBase,
        cpu_millicores: Option<i64>,
        memory_mib: Option<i64>,
        gpu_count: Option<i64>,
    ) -> Self {
        Self {
            base,
            cpu_millicores,
            memory_mib,
            gpu_count,
            saved_only: AtomicBool::new(false),
        }
    }

    fn apply(&self, resources: &mut ResourceLimits) {
        if let Some(cpu) = self.cpu_millicores {
            resources.cpu_millicores = Some(cpu);
        }
        if let Some(memory) = self.memory_mib {
            resources.memory_mib = Some(memory);
        }
        if let Some(gpu) = self.gpu_count {
            resources.gpu_count = Some(gpu);
        }
    }

    fn validate(&self) -> Result<()> {
        let limits = [
            ("cpu", self.cpu_millicores),
            ("memory", self.memory_mib),
            ("gpu", self.gpu_count),
        ];
        for (name, value) in limits {
            if let Some(value) = value.filter(|v| *v < 0) {
                return Err(WorkerError::InvalidTask(format!(
                    "{name} limit must not be negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskWorker for VerticalScalingTask {
    fn key(&self) -> &WorkerKey {
        &self.base.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::VerticalScaling
    }

    fn logger(&self) -> &TaskLogger {
        &self.base.logger
    }

    async fn before_run(&self) -> Result<()> {
        self.validate()?;
        let service = self
            .base
            .resolve_service_with(|service| self.apply(&mut service.resources))
            .await?;
        let controller = &self.base.controller;
        controller
            .store()
            .update_service_resources(&service.service_id, &service.resources)
            .await?;

        let closed = match controller.status().get_status(&service.service_id).await {
            Ok(status) => status.is_closed(),
            Err(e) => {
                warn!(service_id = %service.service_id, error = %e, "Status unknown, treating service as open");
                false
            }
        };
        let deployed = controller
            .store()
            .active_record(&service.service_id)
            .await?
            .is_some();

        if closed || !deployed {
            self.saved_only.store(true, Ordering::Release);
            return Ok(());
        }
        self.base.set_status(ServiceStatus::Upgrade).await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        if self.saved_only.load(Ordering::Acquire) {
            self.base.logger.info(
                "Service is not running, new limits apply on its next start",
                "vertical-scaling",
                "running",
            );
            return Ok(());
        }

        let service = self.base.service()?;
        let Some(record) = self
            .base
            .controller
            .store()
            .active_record(&service.service_id)
            .await?
        else {
            return Ok(());
        };
        self.base.restart_record(service, &record).await
    }

    async fn run_success(&self) {
        if !self.saved_only.load(Ordering::Acquire) {
            self.base.settle_status(ServiceStatus::Running).await;
        }
        self.base
            .logger
            .info("Service limits updated", "vertical-scaling", "success");
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
    }
}
