//! Pod fixtures in the shapes the readiness tracker distinguishes

use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::constants::labels;

/// Lifecycle point a fixture pod is frozen at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    Ready,
    /// Scheduled, containers still starting
    Pending,
    Unschedulable,
    /// Container terminated with reason `Error`
    Crashed,
}

impl PodState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

fn condition(kind: &str, status: bool) -> PodCondition {
    PodCondition {
        type_: kind.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        ..Default::default()
    }
}

fn container(state: ContainerState, ready: bool) -> ContainerStatus {
    ContainerStatus {
        name: "app".to_string(),
        ready,
        state: Some(state),
        ..Default::default()
    }
}

/// Labels a workload stamps on its pods
pub fn pod_labels(alias: &str, version: &str, workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::NAME.to_string(), alias.to_string()),
        (labels::VERSION.to_string(), version.to_string()),
        (labels::WORKLOAD.to_string(), workload.to_string()),
    ])
}

pub fn pod_with_labels(name: &str, pod_labels: BTreeMap<String, String>, state: PodState) -> Pod {
    let (conditions, containers) = match state {
        PodState::Ready => (
            vec![
                condition("PodScheduled", true),
                condition("Initialized", true),
                condition("Ready", true),
            ],
            vec![container(
                ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
                true,
            )],
        ),
        PodState::Pending => (
            vec![
                condition("PodScheduled", true),
                condition("Initialized", false),
                condition("Ready", false),
            ],
            vec![container(
                ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ContainerCreating".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                false,
            )],
        ),
        PodState::Unschedulable => (
            vec![PodCondition {
                reason: Some("Unschedulable".to_string()),
                ..condition("PodScheduled", false)
            }],
            Vec::new(),
        ),
        PodState::Crashed => (
            vec![
                condition("PodScheduled", true),
                condition("Initialized", true),
                condition("Ready", false),
            ],
            vec![container(
                ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        reason: Some("Error".to_string()),
                        message: Some("exit status 1".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                false,
            )],
        ),
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            conditions: Some(conditions),
            container_statuses: Some(containers),
            ..Default::default()
        }),
    }
}

pub fn ready_pod(name: &str, alias: &str, version: &str, workload: &str) -> Pod {
    pod_with_labels(name, pod_labels(alias, version, workload), PodState::Ready)
}

pub fn pending_pod(name: &str, alias: &str, version: &str, workload: &str) -> Pod {
    pod_with_labels(name, pod_labels(alias, version, workload), PodState::Pending)
}

pub fn unschedulable_pod(name: &str, alias: &str, version: &str, workload: &str) -> Pod {
    pod_with_labels(name, pod_labels(alias, version, workload), PodState::Unschedulable)
}

pub fn crashed_pod(name: &str, alias: &str, version: &str, workload: &str) -> Pod {
    pod_with_labels(name, pod_labels(alias, version, workload), PodState::Crashed)
}
