//! Watch-driven scale waits.
//!
//! Both waits race an explicit timer against the pod watch; the workload
//! watch only feeds telemetry.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::{debug, warn};

use super::WorkloadController;
use crate::constants::labels;
use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{ResourceKind, ServiceDesiredState};
use crate::orchestrator::{EventStream, OrchestratorResult, WatchEvent, WorkloadEvent};

/// Pause before re-opening a pod watch the server closed
const WATCH_REOPEN_DELAY: Duration = Duration::from_millis(200);

/// Target of a scale wait
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScaleTarget<'a> {
    pub kind: ResourceKind,
    pub name: &'a str,
    /// Version label carried by the workload's pods
    pub deploy_version: &'a str,
    pub from: i32,
    pub to: i32,
}

/// Whether a pod was created by the named workload resource
pub(crate) fn pod_in_workload(pod: &Pod, resource_name: &str) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::WORKLOAD))
        .is_some_and(|owner| owner == resource_name)
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

async fn next_event<T>(stream: &mut Option<EventStream<T>>) -> Option<OrchestratorResult<T>> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

fn log_workload_event(name: &str, event: &WorkloadEvent) {
    match event {
        WatchEvent::Added(state) | WatchEvent::Modified(state) => debug!(
            workload = %name,
            spec_replicas = state.spec_replicas,
            status_replicas = state.status_replicas,
            ready_replicas = state.ready_replicas,
            "Workload replicas changed"
        ),
        WatchEvent::Deleted(_) => debug!(workload = %name, "Workload deleted"),
    }
}

impl WorkloadController {
    async fn open_workload_watch(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Option<EventStream<WorkloadEvent>> {
        match self.orchestrator.watch_workload(kind, name).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(workload = %name, error = %e, "Workload watch unavailable, continuing without telemetry");
                None
            }
        }
    }

    /// Wait until `target.to` pods of the workload are ready.
    ///
    /// Budget: `(base + probe warmup) × pods added`. A container terminated
    /// with an error fails the wait on the event that reports it.
    pub(crate) async fn wait_scale_up(
        &self,
        service: &ServiceDesiredState,
        target: ScaleTarget<'_>,
        logger: &TaskLogger,
    ) -> Result<()> {
        let added = (target.to - target.from).max(0) as u32;
        if added == 0 {
            return Ok(());
        }
        let timeout = self
            .rollout
            .scale_up_timeout(added, service.probe_warmup_seconds());

        if let Some(state) = self
            .orchestrator
            .get_workload(target.kind, target.name)
            .await?
        {
            if state.ready_replicas >= target.to {
                return Ok(());
            }
        }

        // The watch replays the workload's current pods
        self.tracker.forget_workload(target.name);
        let selector = service.pod_selector(target.deploy_version);
        let mut pods = self.orchestrator.watch_pods(&selector).await?;
        let mut workload = self.open_workload_watch(target.kind, target.name).await;

        logger.info(
            &format!(
                "Waiting for {} to reach {} ready pods (timeout {}s)",
                target.name,
                target.to,
                timeout.as_secs()
            ),
            "scale-up",
            "running",
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(WorkerError::timed_out(format!("scale up {}", target.name), timeout));
                }
                event = next_event(&mut workload) => match event {
                    Some(Ok(event)) => log_workload_event(target.name, &event),
                    Some(Err(e)) => {
                        warn!(workload = %target.name, error = %e, "Workload watch failed");
                        workload = None;
                    }
                    None => workload = None,
                },
                event = pods.next() => match event {
                    Some(Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod))) => {
                        if !pod_in_workload(&pod, target.name) {
                            continue;
                        }
                        self.tracker.add_pod(&pod)?;
                        let ready = self.tracker.ready_count_for(target.name);
                        if ready >= target.to as usize {
                            logger.info(
                                &format!("{} has {} ready pods", target.name, ready),
                                "scale-up",
                                "success",
                            );
                            return Ok(());
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(pod))) => {
                        if pod_in_workload(&pod, target.name) {
                            self.tracker.remove_pod(pod_name(&pod));
                        }
                    }
                    Some(Err(e)) => {
                        warn!(selector = %selector, error = %e, "Pod watch error");
                    }
                    None => {
                        debug!(selector = %selector, "Pod watch closed, re-opening");
                        tokio::time::sleep(WATCH_REOPEN_DELAY).await;
                        pods = self.orchestrator.watch_pods(&selector).await?;
                    }
                },
            }
        }
    }

    /// Wait until `target.from - target.to` pods of the workload are deleted.
    ///
    /// Budget: a fixed allowance per removed pod.
    pub(crate) async fn wait_scale_down(
        &self,
        service: &ServiceDesiredState,
        target: ScaleTarget<'_>,
        logger: &TaskLogger,
    ) -> Result<()> {
        let removed = (target.from - target.to).max(0) as u32;
        if removed == 0 {
            return Ok(());
        }
        let timeout = self.rollout.scale_down_timeout(removed);

        match self
            .orchestrator
            .get_workload(target.kind, target.name)
            .await?
        {
            Some(state) if state.status_replicas > target.to => {}
            _ => return Ok(()),
        }

        let selector = service.pod_selector(target.deploy_version);
        let mut pods = self.orchestrator.watch_pods(&selector).await?;
        let mut workload = self.open_workload_watch(target.kind, target.name).await;
        let mut deleted = 0u32;

        logger.info(
            &format!(
                "Waiting for {} to remove {} pods (timeout {}s)",
                target.name,
                removed,
                timeout.as_secs()
            ),
            "scale-down",
            "running",
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(WorkerError::timed_out(format!("scale down {}", target.name), timeout));
                }
                event = next_event(&mut workload) => match event {
                    Some(Ok(event)) => log_workload_event(target.name, &event),
                    Some(Err(e)) => {
                        warn!(workload = %target.name, error = %e, "Workload watch failed");
                        workload = None;
                    }
                    None => workload = None,
                },
                event = pods.next() => match event {
                    Some(Ok(WatchEvent::Deleted(pod))) => {
                        if !pod_in_workload(&pod, target.name) {
                            continue;
                        }
                        debug!(pod = %pod_name(&pod), "Pod deleted");
                        self.tracker.remove_pod(pod_name(&pod));
                        deleted += 1;
                        if deleted >= removed {
                            logger.info(
                                &format!("{} removed {} pods", target.name, deleted),
                                "scale-down",
                                "success",
                            );
                            return Ok(());
                        }
                    }
                    Some(Ok(WatchEvent::Added(_) | WatchEvent::Modified(_))) => {}
                    Some(Err(e)) => {
                        warn!(selector = %selector, error = %e, "Pod watch error");
                    }
                    None => {
                        debug!(selector = %selector, "Pod watch closed, re-opening");
                        tokio::time::sleep(WATCH_REOPEN_DELAY).await;
                        pods = self.orchestrator.watch_pods(&selector).await?;
                    }
                },
            }
        }
    }
}
