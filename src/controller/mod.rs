//! # Workload Controller
//!
//! Builds, applies, patches and deletes the native workload resources and
//! Services of a tenant service, and blocks on watch-driven waits until the
//! cluster reflects each change.
//!
//! All orchestrator calls made for one service are sequential. Parallelism
//! only exists across tasks, and each task owns its own waits.

pub mod builder;
mod rollout;
mod waits;

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::{RolloutConfig, TimeoutPolicy, TimeoutsConfig, WorkerConfig};
use crate::database::WorkloadStore;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{
    ResourceKind, ScaleMode, ScalingIntent, ServiceDesiredState, WorkloadKind, WorkloadRecord,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult};
use crate::readiness::ReadinessTracker;
use crate::status::StatusSyncClient;

pub use rollout::{RolloutOrdering, RolloutOutcome};
pub(crate) use waits::ScaleTarget;

/// Treat a missing object as already gone
pub(crate) fn ignore_not_found(result: OrchestratorResult<()>) -> OrchestratorResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Apply a timeout policy to the result of a wait.
///
/// Under [`TimeoutPolicy::Continue`] a timeout is logged and swallowed; every
/// other error passes through untouched.
pub(crate) fn within_policy(
    result: Result<()>,
    policy: TimeoutPolicy,
    logger: &TaskLogger,
    step: &str,
) -> Result<()> {
    match result {
        Err(e) if e.is_timeout() && policy == TimeoutPolicy::Continue => {
            logger.info(
                &format!("{e}, continuing in the background"),
                step,
                "timeout",
            );
            Ok(())
        }
        other => other,
    }
}

/// Result of reconciling stored records against the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub checked: usize,
    pub purged: usize,
}

pub struct WorkloadController {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn WorkloadStore>,
    status: Arc<dyn StatusSyncClient>,
    tracker: ReadinessTracker,
    rollout: RolloutConfig,
    timeouts: TimeoutsConfig,
    image_prefix: Option<String>,
}

impl std::fmt::Debug for WorkloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadController")
            .field("rollout", &self.rollout)
            .field("timeouts", &self.timeouts)
            .field("image_prefix", &self.image_prefix)
            .finish_non_exhaustive()
    }
}

impl WorkloadController {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn WorkloadStore>,
        status: Arc<dyn StatusSyncClient>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            status,
            tracker: ReadinessTracker::new(),
            rollout: config.rollout.clone(),
            timeouts: config.timeouts.clone(),
            image_prefix: config.kubernetes.image_prefix.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkloadStore> {
        &self.store
    }

    pub fn status(&self) -> &Arc<dyn StatusSyncClient> {
        &self.status
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    /// Readiness of every pod observed by this controller's waits
    pub fn readiness(&self) -> &ReadinessTracker {
        &self.tracker
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    pub fn rollout_config(&self) -> &RolloutConfig {
        &self.rollout
    }

    /// Native resource kind used for a service's workload kind
    pub fn resource_kind(&self, service: &ServiceDesiredState) -> ResourceKind {
        ResourceKind::for_workload(service.kind, self.rollout.stateless_resource)
    }

    /// Load a service and resolve its workload kind from the service type label
    pub async fn resolve_service(&self, service_id: &str) -> Result<ServiceDesiredState> {
        let mut service = self.store.get_service(service_id).await?;
        let label = self.store.service_type_label(service_id).await?;
        service.kind = WorkloadKind::from_label(label.as_deref());
        Ok(service)
    }

    /// Reject images outside the configured registry prefix
    pub fn check_image(&self, service: &ServiceDesiredState) -> Result<()> {
        match &self.image_prefix {
            Some(prefix) if !service.image.starts_with(prefix.as_str()) => {
                Err(WorkerError::InvalidImage {
                    image: service.image.clone(),
                    prefix: prefix.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Create the service's Service, or re-point an existing one
    async fn ensure_service(&self, service: &ServiceDesiredState) -> Result<()> {
        let spec = builder::service_spec(service);
        match self.orchestrator.create_service(&spec).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                self.orchestrator
                    .update_service_selector(&spec.name, &spec.selector)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the workload and Service for a service that is not running,
    /// then wait for every replica to become ready.
    ///
    /// The record is written before the wait, so a timed out start still
    /// leaves the service deployed.
    #[instrument(skip(self, service, logger), fields(service_id = %service.service_id))]
    pub async fn start_service(
        &self,
        service: &ServiceDesiredState,
        logger: &TaskLogger,
    ) -> Result<WorkloadRecord> {
        self.check_image(service)?;
        let kind = self.resource_kind(service);
        let name = builder::resource_name(service, kind);

        // StatefulSet pods resolve their peers through the headless Service
        if kind == ResourceKind::StatefulSet {
            self.ensure_service(service).await?;
        }

        let spec = builder::workload_spec(service, kind, &name, service.replicas);
        self.orchestrator.create_workload(&spec).await?;
        logger.info(
            &format!("Created {kind} {name} with {} replicas", service.replicas),
            "create-workload",
            "success",
        );

        let record = WorkloadRecord::active(
            &service.tenant_id,
            &service.service_id,
            &name,
            kind,
            &service.deploy_version,
        );
        self.store.add_record(&record).await?;

        if kind != ResourceKind::StatefulSet {
            self.ensure_service(service).await?;
        }
        info!(resource = %name, kind = %kind, "Workload created");

        self.wait_scale_up(
            service,
            ScaleTarget {
                kind,
                name: &name,
                deploy_version: &service.deploy_version,
                from: 0,
                to: service.replicas,
            },
            logger,
        )
        .await?;

        Ok(record)
    }

    /// Delete the Service, drain and delete every recorded workload, then
    /// remove the pods and records left behind.
    ///
    /// A service with nothing recorded is already stopped.
    #[instrument(skip(self, service, logger), fields(service_id = %service.service_id))]
    pub async fn stop_service(
        &self,
        service: &ServiceDesiredState,
        drain_policy: TimeoutPolicy,
        logger: &TaskLogger,
    ) -> Result<()> {
        ignore_not_found(
            self.orchestrator
                .delete_service(&builder::service_name(service))
                .await,
        )?;

        let records = self.store.records_for_service(&service.service_id).await?;
        if records.is_empty() {
            logger.info("No workload recorded for service", "stop", "skipped");
        }

        for record in &records {
            self.drain_workload(service, record, drain_policy, logger)
                .await?;
            self.store
                .delete_record(&record.service_id, &record.resource_name)
                .await?;
        }

        self.delete_orphan_pods(&service.service_id).await?;
        self.store
            .delete_records_for_service(&service.service_id)
            .await?;

        logger.info("Service stopped", "stop", "success");
        Ok(())
    }

    /// Remove Service, workloads and records without waiting on pods.
    /// Used to undo a failed start.
    #[instrument(skip(self, service, logger), fields(service_id = %service.service_id))]
    pub async fn tear_down(&self, service: &ServiceDesiredState, logger: &TaskLogger) -> Result<()> {
        ignore_not_found(
            self.orchestrator
                .delete_service(&builder::service_name(service))
                .await,
        )?;

        for record in self.store.records_for_service(&service.service_id).await? {
            ignore_not_found(
                self.orchestrator
                    .delete_workload(record.resource_kind, &record.resource_name)
                    .await,
            )?;
            self.tracker.forget_workload(&record.resource_name);
        }

        self.delete_orphan_pods(&service.service_id).await?;
        self.store
            .delete_records_for_service(&service.service_id)
            .await?;

        logger.info("Removed service resources", "rollback", "success");
        Ok(())
    }

    async fn drain_workload(
        &self,
        service: &ServiceDesiredState,
        record: &WorkloadRecord,
        drain_policy: TimeoutPolicy,
        logger: &TaskLogger,
    ) -> Result<()> {
        let kind = record.resource_kind;
        let name = record.resource_name.as_str();

        let Some(state) = self.orchestrator.get_workload(kind, name).await? else {
            logger.info(&format!("{kind} {name} already gone"), "stop", "skipped");
            return Ok(());
        };

        if state.spec_replicas > 0 {
            ignore_not_found(self.orchestrator.scale_workload(kind, name, 0).await)?;
            let waited = self
                .wait_scale_down(
                    service,
                    ScaleTarget {
                        kind,
                        name,
                        deploy_version: &record.deploy_version,
                        from: state.spec_replicas,
                        to: 0,
                    },
                    logger,
                )
                .await;
            within_policy(waited, drain_policy, logger, "scale-down")?;
        }

        ignore_not_found(self.orchestrator.delete_workload(kind, name).await)?;
        self.tracker.forget_workload(name);
        logger.info(&format!("Deleted {kind} {name}"), "delete-workload", "success");
        Ok(())
    }

    async fn delete_orphan_pods(&self, service_id: &str) -> Result<()> {
        for pod in self.store.pods_for_service(service_id).await? {
            ignore_not_found(self.orchestrator.delete_pod(&pod.pod_name).await)?;
            self.store.delete_pod_record(&pod.pod_name).await?;
        }
        Ok(())
    }

    /// Move the active workload to `replicas` and wait for the change.
    ///
    /// Returns `None` when the workload already runs that many replicas.
    /// Deletion handling is suppressed on the status service while pods are
    /// being added or removed.
    #[instrument(skip(self, service, logger), fields(service_id = %service.service_id))]
    pub async fn scale_service(
        &self,
        service: &ServiceDesiredState,
        replicas: i32,
        logger: &TaskLogger,
    ) -> Result<Option<ScalingIntent>> {
        let record = self
            .store
            .active_record(&service.service_id)
            .await?
            .ok_or_else(|| WorkerError::not_deployed(&service.service_id))?;
        let kind = record.resource_kind;
        let name = record.resource_name.as_str();

        let state = self
            .orchestrator
            .get_workload(kind, name)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(kind.as_str(), name))?;

        let Some(intent) = ScalingIntent::compute(state.spec_replicas, replicas) else {
            logger.info(
                &format!("{name} already runs {replicas} replicas"),
                "scale",
                "skipped",
            );
            return Ok(None);
        };

        self.status.ignore_delete(name).await?;
        let scaled = self.apply_scaling(service, &record, intent, logger).await;
        if let Err(e) = self.status.rm_ignore_delete(name).await {
            warn!(resource = %name, error = %e, "Failed to restore deletion handling");
        }

        scaled.map(|()| Some(intent))
    }

    async fn apply_scaling(
        &self,
        service: &ServiceDesiredState,
        record: &WorkloadRecord,
        intent: ScalingIntent,
        logger: &TaskLogger,
    ) -> Result<()> {
        let target = ScaleTarget {
            kind: record.resource_kind,
            name: &record.resource_name,
            deploy_version: &record.deploy_version,
            from: intent.current_replicas,
            to: intent.target_replicas,
        };

        self.orchestrator
            .scale_workload(target.kind, target.name, target.to)
            .await?;
        logger.info(
            &format!(
                "Scaling {} from {} to {}",
                target.name, target.from, target.to
            ),
            "scale",
            "running",
        );

        match intent.mode {
            ScaleMode::Up => self.wait_scale_up(service, target, logger).await,
            ScaleMode::Down => self.wait_scale_down(service, target, logger).await,
        }
    }

    /// Point the Service at every pod of the service, whatever its generation
    pub async fn update_service_selector(&self, service: &ServiceDesiredState) -> Result<()> {
        let name = builder::service_name(service);
        match self
            .orchestrator
            .update_service_selector(&name, &service.service_selector())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.orchestrator
                    .create_service(&builder::service_spec(service))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop records whose workload no longer exists in the cluster.
    ///
    /// Records marked for deletion whose resource is still live are kept:
    /// they belong to an interrupted rollout and are retired by the next
    /// rollout of that service.
    #[instrument(skip(self))]
    pub async fn sync_records(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for record in self.store.all_records().await? {
            report.checked += 1;
            let live = self
                .orchestrator
                .get_workload(record.resource_kind, &record.resource_name)
                .await?
                .is_some();

            if live {
                if record.is_delete {
                    warn!(
                        service_id = %record.service_id,
                        resource = %record.resource_name,
                        "Superseded workload still running"
                    );
                }
                continue;
            }

            self.store
                .delete_record(&record.service_id, &record.resource_name)
                .await?;
            report.purged += 1;
            info!(
                service_id = %record.service_id,
                resource = %record.resource_name,
                "Purged record of missing workload"
            );
        }

        Ok(report)
    }
}
