//! # Pod Readiness Tracking
//!
//! Accumulates pod condition observations from watch events and turns them
//! into a ready verdict per pod. A pod moves through
//! unscheduled → scheduled → initialized → ready; each flag is set once.

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::labels;
use crate::constants::timing::SCHEDULING_FAILURE_THRESHOLD;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("container {container} in pod {pod} terminated with error")]
    CrashLoop {
        pod: String,
        container: String,
        message: Option<String>,
    },
}

/// Accumulated readiness state of one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatus {
    pub pod_name: String,
    /// Workload resource that created the pod
    pub workload: Option<String>,
    pub scheduled: Option<bool>,
    pub scheduled_error_count: u32,
    pub initialized: Option<bool>,
    pub ready: Option<bool>,
}

impl PodStatus {
    fn new(pod_name: &str, workload: Option<&str>) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            workload: workload.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready == Some(true)
    }
}

/// What a single observation did to a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this pod is seen ready
    BecameReady,
    /// Nothing new
    Unchanged,
}

/// Mutex-guarded map of pod readiness state, shared by every wait of a
/// controller. Entries are keyed by pod name and tagged with the workload
/// that owns the pod.
#[derive(Debug)]
pub struct ReadinessTracker {
    pods: Mutex<HashMap<String, PodStatus>>,
    failure_threshold: u32,
}

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::with_failure_threshold(SCHEDULING_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(failure_threshold: u32) -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            failure_threshold,
        }
    }

    /// Feed one added or modified pod into the tracker
    pub fn add_pod(&self, pod: &Pod) -> Result<Observation, ReadinessError> {
        let Some(name) = pod.metadata.name.as_deref() else {
            return Ok(Observation::Unchanged);
        };

        check_terminated_containers(name, pod)?;
        let workload = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::WORKLOAD))
            .map(String::as_str);

        let mut pods = self.pods.lock();
        let status = pods
            .entry(name.to_string())
            .or_insert_with(|| PodStatus::new(name, workload));

        let conditions = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let condition = |kind: &str| {
            conditions
                .iter()
                .find(|c| c.type_ == kind)
                .map(|c| c.status == "True")
        };

        if status.scheduled.is_none() {
            match condition("PodScheduled") {
                Some(true) => {
                    status.scheduled = Some(true);
                    status.scheduled_error_count = 0;
                }
                Some(false) => {
                    status.scheduled_error_count += 1;
                    if status.scheduled_error_count >= self.failure_threshold {
                        warn!(
                            pod = %name,
                            failures = status.scheduled_error_count,
                            "Pod cannot be scheduled"
                        );
                    }
                }
                None => {}
            }
        }

        if status.scheduled == Some(true) && status.initialized.is_none() {
            if let Some(true) = condition("Initialized") {
                status.initialized = Some(true);
            }
        }

        if status.initialized == Some(true)
            && status.ready.is_none()
            && condition("Ready") == Some(true)
            && all_containers_ready(pod)
        {
            status.ready = Some(true);
            debug!(pod = %name, "Pod became ready");
            return Ok(Observation::BecameReady);
        }

        Ok(Observation::Unchanged)
    }

    /// Forget a pod observed as deleted
    pub fn remove_pod(&self, pod_name: &str) -> Option<PodStatus> {
        self.pods.lock().remove(pod_name)
    }

    pub fn status(&self, pod_name: &str) -> Option<PodStatus> {
        self.pods.lock().get(pod_name).cloned()
    }

    pub fn ready_count(&self) -> usize {
        self.pods.lock().values().filter(|p| p.is_ready()).count()
    }

    /// Ready pods created by one workload resource
    pub fn ready_count_for(&self, workload: &str) -> usize {
        self.pods
            .lock()
            .values()
            .filter(|p| p.is_ready() && p.workload.as_deref() == Some(workload))
            .count()
    }

    /// Drop every pod of a workload; returns how many were tracked
    pub fn forget_workload(&self, workload: &str) -> usize {
        let mut pods = self.pods.lock();
        let before = pods.len();
        pods.retain(|_, p| p.workload.as_deref() != Some(workload));
        before - pods.len()
    }

    pub fn len(&self) -> usize {
        self.pods.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.lock().is_empty()
    }
}

fn all_containers_ready(pod: &Pod) -> bool {
    match pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|c| c.ready),
        _ => false,
    }
}

fn check_terminated_containers(pod_name: &str, pod: &Pod) -> Result<(), ReadinessError> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    for container in statuses.into_iter().flatten() {
        let terminated = container
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref());
        if let Some(terminated) = terminated {
            if terminated.reason.as_deref() == Some("Error") {
                return Err(ReadinessError::CrashLoop {
                    pod: pod_name.to_string(),
                    container: container.name.clone(),
                    message: terminated.message.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::pods::{crashed_pod, pending_pod, ready_pod, unschedulable_pod};

    #[test]
    fn test_ready_reported_once() {
        let tracker = ReadinessTracker::new();
        let pod = ready_pod("web-abc-1", "web", "v1", "web-abc");

        assert_eq!(tracker.add_pod(&pod), Ok(Observation::BecameReady));
        assert_eq!(tracker.add_pod(&pod), Ok(Observation::Unchanged));
        assert_eq!(tracker.ready_count(), 1);
    }

    #[test]
    fn test_pending_pod_not_ready() {
        let tracker = ReadinessTracker::new();
        let pod = pending_pod("web-abc-1", "web", "v1", "web-abc");

        assert_eq!(tracker.add_pod(&pod), Ok(Observation::Unchanged));
        let status = tracker.status("web-abc-1").unwrap();
        assert_eq!(status.scheduled, Some(true));
        assert_eq!(status.ready, None);
    }

    #[test]
    fn test_scheduling_failures_counted() {
        let tracker = ReadinessTracker::new();
        let pod = unschedulable_pod("web-abc-1", "web", "v1", "web-abc");

        for _ in 0..4 {
            assert_eq!(tracker.add_pod(&pod), Ok(Observation::Unchanged));
        }
        let status = tracker.status("web-abc-1").unwrap();
        assert_eq!(status.scheduled, None);
        assert_eq!(status.scheduled_error_count, 4);
    }

    #[test]
    fn test_terminated_container_is_crash_loop() {
        let tracker = ReadinessTracker::new();
        let pod = crashed_pod("web-abc-1", "web", "v1", "web-abc");

        let err = tracker.add_pod(&pod).unwrap_err();
        assert!(matches!(err, ReadinessError::CrashLoop { ref pod, .. } if pod == "web-abc-1"));
    }

    #[test]
    fn test_counts_are_scoped_to_workload() {
        let tracker = ReadinessTracker::new();
        tracker
            .add_pod(&ready_pod("web-old-1", "web", "v1", "web-old"))
            .unwrap();
        tracker
            .add_pod(&ready_pod("web-new-1", "web", "v1", "web-new"))
            .unwrap();
        tracker
            .add_pod(&pending_pod("web-new-2", "web", "v1", "web-new"))
            .unwrap();

        assert_eq!(tracker.ready_count(), 2);
        assert_eq!(tracker.ready_count_for("web-new"), 1);
        assert_eq!(tracker.forget_workload("web-new"), 2);
        assert_eq!(tracker.ready_count_for("web-new"), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_remove_pod() {
        let tracker = ReadinessTracker::new();
        tracker
            .add_pod(&ready_pod("web-abc-1", "web", "v1", "web-abc"))
            .unwrap();

        assert!(tracker.remove_pod("web-abc-1").is_some());
        assert!(tracker.is_empty());
        assert!(tracker.remove_pod("web-abc-1").is_none());
    }
}
