//! # Workload Records
//!
//! Bookkeeping that maps a service to the native workload resource currently
//! serving it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::service::WorkloadKind;

/// Native workload resource kinds the controller manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    StatefulSet,
    Deployment,
    ReplicationController,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::ReplicationController => "ReplicationController",
        }
    }

    /// Resource kind used for a workload kind
    pub fn for_workload(kind: WorkloadKind, stateless: ResourceKind) -> Self {
        match kind {
            WorkloadKind::Stateful => Self::StatefulSet,
            WorkloadKind::Stateless => stateless,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StatefulSet" | "statefulset" => Ok(Self::StatefulSet),
            "Deployment" | "deployment" => Ok(Self::Deployment),
            "ReplicationController" | "replicationcontroller" => Ok(Self::ReplicationController),
            other => Err(format!("Invalid resource kind: {other}")),
        }
    }
}

/// Row tying a service to one workload resource.
///
/// At most one record per service has `is_delete == false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub tenant_id: String,
    pub service_id: String,
    pub resource_name: String,
    pub resource_kind: ResourceKind,
    pub deploy_version: String,
    pub is_delete: bool,
}

impl WorkloadRecord {
    pub fn active(
        tenant_id: impl Into<String>,
        service_id: impl Into<String>,
        resource_name: impl Into<String>,
        resource_kind: ResourceKind,
        deploy_version: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            service_id: service_id.into(),
            resource_name: resource_name.into(),
            resource_kind,
            deploy_version: deploy_version.into(),
            is_delete: false,
        }
    }
}

/// Pod known to belong to a workload resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub pod_name: String,
    pub service_id: String,
    pub resource_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    Up,
    Down,
}

/// Direction and size of a replica change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingIntent {
    pub mode: ScaleMode,
    pub current_replicas: i32,
    pub target_replicas: i32,
}

impl ScalingIntent {
    /// Compare the live replica count with the desired one; equal counts need no change
    pub fn compute(current_replicas: i32, target_replicas: i32) -> Option<Self> {
        let mode = match target_replicas.cmp(&current_replicas) {
            std::cmp::Ordering::Greater => ScaleMode::Up,
            std::cmp::Ordering::Less => ScaleMode::Down,
            std::cmp::Ordering::Equal => return None,
        };
        Some(Self {
            mode,
            current_replicas,
            target_replicas,
        })
    }

    /// Number of pods added or removed
    pub fn delta(&self) -> u32 {
        (self.target_replicas - self.current_replicas).unsigned_abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stateless_resource_is_configurable() {
        assert_eq!(
            ResourceKind::for_workload(WorkloadKind::Stateful, ResourceKind::Deployment),
            ResourceKind::StatefulSet
        );
        assert_eq!(
            ResourceKind::for_workload(WorkloadKind::Stateless, ResourceKind::Deployment),
            ResourceKind::Deployment
        );
    }

    #[test]
    fn test_equal_counts_are_noop() {
        assert_eq!(ScalingIntent::compute(3, 3), None);
    }

    proptest! {
        #[test]
        fn scaling_intent_direction_matches_counts(current in 0i32..100, target in 0i32..100) {
            match ScalingIntent::compute(current, target) {
                None => prop_assert_eq!(current, target),
                Some(intent) => {
                    prop_assert_eq!(intent.delta() as i32, (target - current).abs());
                    prop_assert_eq!(intent.mode == ScaleMode::Up, target > current);
                }
            }
        }
    }
}
