//! # Service Desired State
//!
//! Read-only description of what a tenant service should look like when
//! running. Loaded from the store once per task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::labels;

/// Closed set of workload kinds a service resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Stateful,
    #[default]
    Stateless,
}

impl WorkloadKind {
    /// Resolve the kind from the service type label; anything unlabelled is stateless
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some(labels::STATEFUL_SERVICE_TYPE) => Self::Stateful,
            _ => Self::Stateless,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum VolumeSource {
    HostPath { path: String },
    EmptyDir,
    Claim { claim_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ProbeAction {
    Tcp { port: i32 },
    Http { port: i32, path: String },
}

/// Readiness probe timing, also used to size scale-up waits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub action: ProbeAction,
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default = "default_period")]
    pub period_seconds: i32,
    #[serde(default = "default_threshold")]
    pub success_threshold: i32,
    #[serde(default = "default_threshold")]
    pub timeout_seconds: i32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
}

fn default_period() -> i32 {
    3
}

fn default_threshold() -> i32 {
    1
}

fn default_failure_threshold() -> i32 {
    3
}

impl ProbeSpec {
    /// Seconds a single container needs before the probe can first succeed
    pub fn warmup_seconds(&self) -> u64 {
        let secs = self.initial_delay_seconds.max(0) as i64
            + self.success_threshold.max(0) as i64 * self.period_seconds.max(0) as i64;
        secs as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit in millicores
    #[serde(default)]
    pub cpu_millicores: Option<i64>,
    /// Memory limit in MiB
    #[serde(default)]
    pub memory_mib: Option<i64>,
    /// Whole GPUs per container
    #[serde(default)]
    pub gpu_count: Option<i64>,
}

/// Desired state of one tenant service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDesiredState {
    pub tenant_id: String,
    pub service_id: String,
    pub service_alias: String,
    pub replicas: i32,
    pub image: String,
    pub deploy_version: String,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Node labels the pods must be placed on
    #[serde(default)]
    pub required_node_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub readiness_probe: Option<ProbeSpec>,
    #[serde(default)]
    pub kind: WorkloadKind,
    /// Whether the service tolerates two generations serving traffic at once.
    /// `None` leaves the rollout ordering to the operation's default.
    #[serde(default)]
    pub parallel_generations: Option<bool>,
}

impl ServiceDesiredState {
    /// Labels selecting every pod of this service at its deploy version
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::NAME.to_string(), self.service_alias.clone()),
            (labels::VERSION.to_string(), self.deploy_version.clone()),
        ])
    }

    /// Labels the Service selects on. Deploy version is left out so every
    /// generation of the service receives traffic while pods are swapped.
    pub fn service_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(labels::NAME.to_string(), self.service_alias.clone())])
    }

    /// Label selector string for watching this service's pods at a deploy version
    pub fn pod_selector(&self, deploy_version: &str) -> String {
        format!(
            "{}={},{}={}",
            labels::NAME,
            self.service_alias,
            labels::VERSION,
            deploy_version
        )
    }

    /// Per-container warmup summed over the service's containers
    pub fn probe_warmup_seconds(&self) -> u64 {
        self.readiness_probe
            .as_ref()
            .map(ProbeSpec::warmup_seconds)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_label() {
        assert_eq!(
            WorkloadKind::from_label(Some("StatefulServiceType")),
            WorkloadKind::Stateful
        );
        assert_eq!(
            WorkloadKind::from_label(Some("StatelessServiceType")),
            WorkloadKind::Stateless
        );
        assert_eq!(WorkloadKind::from_label(None), WorkloadKind::Stateless);
    }

    #[test]
    fn test_probe_warmup() {
        let probe = ProbeSpec {
            action: ProbeAction::Tcp { port: 5000 },
            initial_delay_seconds: 10,
            period_seconds: 5,
            success_threshold: 2,
            timeout_seconds: 1,
            failure_threshold: 3,
        };
        assert_eq!(probe.warmup_seconds(), 20);
    }
}
