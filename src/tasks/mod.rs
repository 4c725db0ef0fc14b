//! # Task State Machines
//!
//! One worker per lifecycle intent. Every worker follows the same contract:
//! the executor calls `before_run`, then `run`, then exactly one of
//! `run_success` / `run_error`, then `after_run`.
//!
//! Workers translate an intent into [`WorkloadController`] calls and publish
//! the externally visible status at phase boundaries.

mod horizontal_scaling;
mod restart;
mod rolling_upgrade;
mod start;
mod stop;
mod vertical_scaling;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TimeoutPolicy;
use crate::constants::ServiceStatus;
use crate::controller::{RolloutOrdering, RolloutOutcome, WorkloadController};
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{
    ResourceKind, ServiceDesiredState, Task, TaskBody, TaskKind, WorkerKey, WorkloadRecord,
};

pub use horizontal_scaling::HorizontalScalingTask;
pub use restart::RestartTask;
pub use rolling_upgrade::RollingUpgradeTask;
pub use start::StartTask;
pub use stop::StopTask;
pub use vertical_scaling::VerticalScalingTask;

#[async_trait]
pub trait TaskWorker: Send + Sync {
    fn key(&self) -> &WorkerKey;

    fn kind(&self) -> TaskKind;

    fn logger(&self) -> &TaskLogger;

    /// Resolve the service and publish the opening status
    async fn before_run(&self) -> Result<()>;

    async fn run(&self) -> Result<()>;

    async fn run_success(&self);

    /// Compensate for a failed `before_run` or `run`
    async fn run_error(&self, err: &WorkerError);

    /// Always called last
    async fn after_run(&self) {
        self.logger().release();
    }

    /// Ask the worker to stop at its next step boundary
    async fn stop(&self) -> Result<()>;

    /// Undo what a running worker has done so far
    async fn roll_back(&self);
}

/// Build the worker for a decoded task; `None` for bodies nobody handles
pub fn build_worker(task: &Task, controller: Arc<WorkloadController>) -> Option<Arc<dyn TaskWorker>> {
    let kind = task.kind()?;
    let base = TaskBase::new(task, kind, controller);

    let worker: Arc<dyn TaskWorker> = match &task.body {
        TaskBody::Start(_) => Arc::new(StartTask::new(base)),
        TaskBody::Stop(_) => Arc::new(StopTask::new(base)),
        TaskBody::Restart(_) => Arc::new(RestartTask::new(base)),
        TaskBody::HorizontalScaling(body) => {
            Arc::new(HorizontalScalingTask::new(base, body.replicas))
        }
        TaskBody::VerticalScaling(body) => Arc::new(VerticalScalingTask::new(
            base,
            body.container_cpu,
            body.container_memory,
            body.container_gpu,
        )),
        TaskBody::RollingUpgrade(body) => {
            Arc::new(RollingUpgradeTask::new(base, body.new_deploy_version.clone()))
        }
        TaskBody::Rollback(body) => {
            Arc::new(RollingUpgradeTask::new(base, body.old_deploy_version.clone()))
        }
        TaskBody::Default(_) => return None,
    };
    Some(worker)
}

/// State shared by every task worker
pub struct TaskBase {
    key: WorkerKey,
    kind: TaskKind,
    service_id: String,
    logger: TaskLogger,
    controller: Arc<WorkloadController>,
    cancel: CancellationToken,
    service: OnceLock<ServiceDesiredState>,
    /// Final status is left to the status service
    status_deferred: AtomicBool,
    /// A start is underway, so failures tear the service down
    starting: AtomicBool,
}

impl TaskBase {
    fn new(task: &Task, kind: TaskKind, controller: Arc<WorkloadController>) -> Self {
        Self {
            key: task.key(),
            kind,
            service_id: task.body.service_id().unwrap_or_default().to_string(),
            logger: TaskLogger::new(&task.event_id),
            controller,
            cancel: CancellationToken::new(),
            service: OnceLock::new(),
            status_deferred: AtomicBool::new(false),
            starting: AtomicBool::new(false),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Load the service once; `adjust` may rewrite fields the task overrides
    async fn resolve_service_with(
        &self,
        adjust: impl FnOnce(&mut ServiceDesiredState),
    ) -> Result<&ServiceDesiredState> {
        if let Some(service) = self.service.get() {
            return Ok(service);
        }
        let mut service = self.controller.resolve_service(&self.service_id).await?;
        adjust(&mut service);
        Ok(self.service.get_or_init(|| service))
    }

    async fn resolve_service(&self) -> Result<&ServiceDesiredState> {
        self.resolve_service_with(|_| {}).await
    }

    fn service(&self) -> Result<&ServiceDesiredState> {
        self.service
            .get()
            .ok_or_else(|| WorkerError::InvalidTask(format!("service {} not resolved", self.service_id)))
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        self.controller.timeouts().policy_for(self.kind)
    }

    /// Publish a status; failures are logged and do not fail the task
    async fn set_status(&self, status: ServiceStatus) {
        match self.controller.status().set_status(&self.service_id, status).await {
            Ok(()) => info!(service_id = %self.service_id, status = %status, "Status published"),
            Err(e) => warn!(service_id = %self.service_id, status = %status, error = %e, "Failed to publish status"),
        }
    }

    async fn check_status(&self) {
        if let Err(e) = self.controller.status().check_status(&self.service_id).await {
            warn!(service_id = %self.service_id, error = %e, "Failed to request status check");
        }
    }

    /// Publish `status`, or hand the decision to the status service when a
    /// wait timed out and the task carried on regardless
    async fn settle_status(&self, status: ServiceStatus) {
        if self.status_deferred.load(Ordering::Acquire) {
            self.check_status().await;
        } else {
            self.set_status(status).await;
        }
    }

    /// Apply the task's timeout policy to a wait result
    fn tolerate_timeout(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_timeout() && self.timeout_policy() == TimeoutPolicy::Continue => {
                self.status_deferred.store(true, Ordering::Release);
                self.logger.info(
                    &format!("{e}, started in the background, please monitor"),
                    self.kind.as_str(),
                    "timeout",
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn start(&self, service: &ServiceDesiredState) -> Result<()> {
        self.starting.store(true, Ordering::Release);
        let started = self
            .controller
            .start_service(service, &self.logger)
            .await
            .map(|_| ());
        self.tolerate_timeout(started)
    }

    /// Stop the running generation and start a fresh one
    async fn replace_by_restart(&self, service: &ServiceDesiredState) -> Result<()> {
        self.controller
            .stop_service(service, self.timeout_policy(), &self.logger)
            .await?;
        self.set_status(ServiceStatus::Starting).await;
        self.start(service).await
    }

    /// Bring the recorded generation back up at the service's current
    /// definition. ReplicationControllers are replaced pod by pod so the
    /// service never goes fully dark.
    async fn restart_record(
        &self,
        service: &ServiceDesiredState,
        record: &WorkloadRecord,
    ) -> Result<()> {
        match record.resource_kind {
            ResourceKind::ReplicationController => {
                self.set_status(ServiceStatus::Starting).await;
                self.replace_by_rollout(service, RolloutOrdering::DrainFirst)
                    .await
            }
            ResourceKind::StatefulSet | ResourceKind::Deployment => {
                self.replace_by_restart(service).await
            }
        }
    }

    /// Roll pods over to a new resource, then point the Service at it
    async fn replace_by_rollout(
        &self,
        service: &ServiceDesiredState,
        default_ordering: RolloutOrdering,
    ) -> Result<()> {
        let ordering = RolloutOrdering::resolve(service.parallel_generations, default_ordering);
        let outcome = self
            .controller
            .rolling_replace(service, ordering, &self.cancel, &self.logger)
            .await?;

        match outcome {
            RolloutOutcome::Started { .. } => {}
            RolloutOutcome::Completed { .. } => {
                self.controller.update_service_selector(service).await?;
            }
            RolloutOutcome::Interrupted { .. } => {
                self.status_deferred.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Undo a failed start: drop Service, workload and records
    async fn compensate_start(&self) {
        let Ok(service) = self.service() else {
            return;
        };
        match self.controller.tear_down(service, &self.logger).await {
            Ok(()) => self.set_status(ServiceStatus::Closed).await,
            Err(e) => {
                self.logger
                    .error(&format!("Failed to remove service resources: {e}"), "rollback", "failure");
                self.check_status().await;
            }
        }
    }

    /// Shared failure handling: tear down half-started services, otherwise
    /// let the status service re-derive the status from the cluster
    async fn handle_error(&self, err: &WorkerError) {
        self.logger
            .error(&err.to_string(), self.kind.as_str(), "failure");

        if self.starting.load(Ordering::Acquire) {
            self.compensate_start().await;
        } else {
            self.check_status().await;
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
