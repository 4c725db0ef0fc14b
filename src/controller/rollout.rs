//! Pod-by-pod replacement of a workload by a freshly named one

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{builder, ignore_not_found, within_policy, ScaleTarget, WorkloadController};
use crate::error::Result;
use crate::logging::TaskLogger;
use crate::models::{ServiceDesiredState, WorkloadRecord};

/// Order of the two scale operations inside one replacement step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutOrdering {
    /// Raise the new generation before draining the old one; both serve briefly
    SurgeFirst,
    /// Drain the old generation before raising the new one; never two live pods
    /// of different generations
    DrainFirst,
}

impl RolloutOrdering {
    /// Ordering for a service's `parallel_generations` capability, falling back
    /// to the operation's default when the service does not declare it
    pub fn resolve(parallel_generations: Option<bool>, default: Self) -> Self {
        match parallel_generations {
            Some(true) => Self::SurgeFirst,
            Some(false) => Self::DrainFirst,
            None => default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Nothing was deployed, so the service was started from scratch
    Started { resource_name: String },
    /// The old generation is retired and the new one serves every replica
    Completed { resource_name: String },
    /// Stopped between steps; both generations stay at the reached split
    Interrupted {
        completed_steps: i32,
        new_replicas: i32,
        old_replicas: i32,
    },
}

/// Live replica counts of the two generations during a rollout
struct Generations<'a> {
    old: &'a WorkloadRecord,
    new: &'a WorkloadRecord,
    old_replicas: i32,
    new_replicas: i32,
}

impl WorkloadController {
    /// Replace the active workload with a new resource built from `service`,
    /// one pod at a time.
    ///
    /// The stop token is consulted between steps only; an in-flight wait is
    /// never interrupted.
    #[instrument(skip(self, service, cancel, logger), fields(service_id = %service.service_id))]
    pub async fn rolling_replace(
        &self,
        service: &ServiceDesiredState,
        ordering: RolloutOrdering,
        cancel: &CancellationToken,
        logger: &TaskLogger,
    ) -> Result<RolloutOutcome> {
        self.retire_superseded(service, logger).await?;

        let Some(old) = self.store.active_record(&service.service_id).await? else {
            logger.info("Service is not deployed, starting it", "rollout", "running");
            let record = self.start_service(service, logger).await?;
            return Ok(RolloutOutcome::Started {
                resource_name: record.resource_name,
            });
        };
        self.check_image(service)?;

        let old_replicas = self
            .orchestrator
            .get_workload(old.resource_kind, &old.resource_name)
            .await?
            .map(|state| state.spec_replicas)
            .unwrap_or(0);

        let kind = old.resource_kind;
        let new_name = builder::resource_name(service, kind);
        self.orchestrator
            .create_workload(&builder::workload_spec(service, kind, &new_name, 0))
            .await?;

        self.store
            .mark_record_deleting(&old.service_id, &old.resource_name)
            .await?;
        let new = WorkloadRecord::active(
            &service.tenant_id,
            &service.service_id,
            &new_name,
            kind,
            &service.deploy_version,
        );
        self.store.add_record(&new).await?;
        self.update_service_selector(service).await?;

        logger.info(
            &format!(
                "Replacing {} ({} replicas) with {} ({:?})",
                old.resource_name, old_replicas, new_name, ordering
            ),
            "rollout",
            "running",
        );

        let mut generations = Generations {
            old: &old,
            new: &new,
            old_replicas,
            new_replicas: 0,
        };
        let target = service.replicas;
        let steps = target.max(old_replicas);

        for step in 1..=steps {
            let new_to = step.min(target);
            let old_to = (old_replicas - step).max(0);

            match ordering {
                RolloutOrdering::SurgeFirst => {
                    self.step_new(service, &mut generations, new_to, logger)
                        .await?;
                    self.step_old(service, &mut generations, old_to, logger)
                        .await?;
                }
                RolloutOrdering::DrainFirst => {
                    self.step_old(service, &mut generations, old_to, logger)
                        .await?;
                    self.step_new(service, &mut generations, new_to, logger)
                        .await?;
                }
            }

            logger.info(
                &format!(
                    "Step {step}/{steps}: {}={} {}={}",
                    new_name,
                    generations.new_replicas,
                    old.resource_name,
                    generations.old_replicas
                ),
                "rollout",
                "running",
            );

            if step == steps {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        step,
                        new_replicas = generations.new_replicas,
                        old_replicas = generations.old_replicas,
                        "Rollout stopped between steps"
                    );
                    logger.info(
                        &format!("Rollout stopped after step {step}, both generations left running"),
                        "rollout",
                        "interrupted",
                    );
                    return Ok(RolloutOutcome::Interrupted {
                        completed_steps: step,
                        new_replicas: generations.new_replicas,
                        old_replicas: generations.old_replicas,
                    });
                }
                _ = tokio::time::sleep(self.rollout.step_interval()) => {}
            }
        }

        self.retire(service, &old, false, logger).await?;
        info!(old = %old.resource_name, new = %new_name, "Rollout completed");
        logger.info(
            &format!("{new_name} now serves {target} replicas"),
            "rollout",
            "success",
        );

        Ok(RolloutOutcome::Completed {
            resource_name: new_name,
        })
    }

    async fn step_new(
        &self,
        service: &ServiceDesiredState,
        generations: &mut Generations<'_>,
        to: i32,
        logger: &TaskLogger,
    ) -> Result<()> {
        let from = generations.new_replicas;
        if to <= from {
            return Ok(());
        }
        let record = generations.new;

        self.orchestrator
            .scale_workload(record.resource_kind, &record.resource_name, to)
            .await?;
        generations.new_replicas = to;

        let waited = self
            .wait_scale_up(
                service,
                ScaleTarget {
                    kind: record.resource_kind,
                    name: &record.resource_name,
                    deploy_version: &record.deploy_version,
                    from,
                    to,
                },
                logger,
            )
            .await;
        within_policy(waited, self.timeouts.rollout_step, logger, "scale-up")
    }

    async fn step_old(
        &self,
        service: &ServiceDesiredState,
        generations: &mut Generations<'_>,
        to: i32,
        logger: &TaskLogger,
    ) -> Result<()> {
        let from = generations.old_replicas;
        if to >= from {
            return Ok(());
        }
        let record = generations.old;

        ignore_not_found(
            self.orchestrator
                .scale_workload(record.resource_kind, &record.resource_name, to)
                .await,
        )?;
        generations.old_replicas = to;

        let waited = self
            .wait_scale_down(
                service,
                ScaleTarget {
                    kind: record.resource_kind,
                    name: &record.resource_name,
                    deploy_version: &record.deploy_version,
                    from,
                    to,
                },
                logger,
            )
            .await;
        within_policy(waited, self.timeouts.rollout_step, logger, "scale-down")
    }

    /// Finish what an interrupted rollout left behind: drain and delete every
    /// generation already marked for deletion.
    async fn retire_superseded(
        &self,
        service: &ServiceDesiredState,
        logger: &TaskLogger,
    ) -> Result<()> {
        let leftovers = self
            .store
            .records_for_service(&service.service_id)
            .await?
            .into_iter()
            .filter(|record| record.is_delete);

        for record in leftovers {
            warn!(resource = %record.resource_name, "Retiring generation left by an interrupted rollout");
            logger.info(
                &format!("Draining {} left by an earlier rollout", record.resource_name),
                "rollout",
                "running",
            );
            self.retire(service, &record, true, logger).await?;
        }
        Ok(())
    }

    /// Delete the superseded resource, its record and any pods still recorded
    /// under it, draining its pods first when `drain` is set. Deletion
    /// handling is suppressed on the status service meanwhile.
    async fn retire(
        &self,
        service: &ServiceDesiredState,
        old: &WorkloadRecord,
        drain: bool,
        logger: &TaskLogger,
    ) -> Result<()> {
        self.status.ignore_delete(&old.resource_name).await?;
        let retired: Result<()> = async {
            if drain {
                self.drain_workload(service, old, self.timeouts.rollout_step, logger)
                    .await?;
            } else {
                ignore_not_found(
                    self.orchestrator
                        .delete_workload(old.resource_kind, &old.resource_name)
                        .await,
                )?;
                self.tracker.forget_workload(&old.resource_name);
            }
            self.clear_generation(old).await
        }
        .await;
        if let Err(e) = self.status.rm_ignore_delete(&old.resource_name).await {
            warn!(resource = %old.resource_name, error = %e, "Failed to restore deletion handling");
        }
        retired?;

        logger.info(
            &format!("Retired {} {}", old.resource_kind, old.resource_name),
            "retire",
            "success",
        );
        Ok(())
    }

    /// Drop the record of a deleted generation and any pods still recorded under it
    async fn clear_generation(&self, old: &WorkloadRecord) -> Result<()> {
        self.store
            .delete_record(&old.service_id, &old.resource_name)
            .await?;

        for pod in self
            .store
            .pods_for_resource(&old.service_id, &old.resource_name)
            .await?
        {
            ignore_not_found(self.orchestrator.delete_pod(&pod.pod_name).await)?;
            self.store.delete_pod_record(&pod.pod_name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_capability_flag() {
        assert_eq!(
            RolloutOrdering::resolve(Some(true), RolloutOrdering::DrainFirst),
            RolloutOrdering::SurgeFirst
        );
        assert_eq!(
            RolloutOrdering::resolve(Some(false), RolloutOrdering::SurgeFirst),
            RolloutOrdering::DrainFirst
        );
        assert_eq!(
            RolloutOrdering::resolve(None, RolloutOrdering::DrainFirst),
            RolloutOrdering::DrainFirst
        );
    }
}
