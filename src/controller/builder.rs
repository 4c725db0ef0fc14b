//! Builds native workload and Service specs from a service's desired state

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort as KubeContainerPort, EmptyDirVolumeSource, EnvVar,
    HTTPGetAction, HostPathVolumeSource, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::labels;
use crate::models::{
    ProbeAction, ProbeSpec, ResourceKind, ServiceDesiredState, VolumeSource, WorkloadKind,
};
use crate::orchestrator::{ServicePortSpec, ServiceSpec, WorkloadSpec};

/// Name for a new workload resource.
///
/// StatefulSets keep the service alias so pod identities stay stable; other
/// kinds get a fresh suffix so two generations can coexist.
pub fn resource_name(service: &ServiceDesiredState, kind: ResourceKind) -> String {
    match kind {
        ResourceKind::StatefulSet => service.service_alias.clone(),
        _ => {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", service.service_alias, &suffix[..8])
        }
    }
}

pub fn service_name(service: &ServiceDesiredState) -> String {
    service.service_alias.clone()
}

/// Labels stamped on a workload and its pods
pub fn workload_labels(
    service: &ServiceDesiredState,
    resource_name: &str,
) -> BTreeMap<String, String> {
    let mut stamped = service.selector_labels();
    stamped.insert(labels::WORKLOAD.to_string(), resource_name.to_string());
    stamped.insert(labels::SERVICE_ID.to_string(), service.service_id.clone());
    stamped.insert(labels::TENANT_ID.to_string(), service.tenant_id.clone());
    stamped.insert(
        labels::CREATOR.to_string(),
        labels::CREATOR_VALUE.to_string(),
    );
    stamped
}

pub fn workload_spec(
    service: &ServiceDesiredState,
    kind: ResourceKind,
    name: &str,
    replicas: i32,
) -> WorkloadSpec {
    let stamped = workload_labels(service, name);
    let mut selector = service.selector_labels();
    selector.insert(labels::WORKLOAD.to_string(), name.to_string());

    WorkloadSpec {
        kind,
        name: name.to_string(),
        labels: stamped.clone(),
        selector,
        replicas,
        service_name: (kind == ResourceKind::StatefulSet).then(|| service_name(service)),
        template: pod_template(service, stamped),
    }
}

pub fn service_spec(service: &ServiceDesiredState) -> ServiceSpec {
    let ports = service
        .ports
        .iter()
        .map(|p| ServicePortSpec {
            name: p
                .name
                .clone()
                .unwrap_or_else(|| format!("port-{}", p.container_port)),
            port: p.container_port,
            protocol: p.protocol.clone(),
        })
        .collect();

    let mut service_labels = service.selector_labels();
    service_labels.insert(labels::SERVICE_ID.to_string(), service.service_id.clone());

    ServiceSpec {
        name: service_name(service),
        labels: service_labels,
        selector: service.service_selector(),
        ports,
        headless: service.kind == WorkloadKind::Stateful,
    }
}

fn pod_template(
    service: &ServiceDesiredState,
    pod_labels: BTreeMap<String, String>,
) -> PodTemplateSpec {
    let env = service
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let ports = service
        .ports
        .iter()
        .map(|p| KubeContainerPort {
            container_port: p.container_port,
            protocol: Some(p.protocol.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mounts = service
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: v.mount_path.clone(),
            read_only: Some(v.read_only),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let volumes = service
        .volumes
        .iter()
        .map(|v| {
            let mut volume = Volume {
                name: v.name.clone(),
                ..Default::default()
            };
            match &v.source {
                VolumeSource::HostPath { path } => {
                    volume.host_path = Some(HostPathVolumeSource {
                        path: path.clone(),
                        ..Default::default()
                    });
                }
                VolumeSource::EmptyDir => {
                    volume.empty_dir = Some(EmptyDirVolumeSource::default());
                }
                VolumeSource::Claim { claim_name } => {
                    volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.clone(),
                        ..Default::default()
                    });
                }
            }
            volume
        })
        .collect::<Vec<_>>();

    let container = Container {
        name: service.service_alias.clone(),
        image: Some(service.image.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        resources: resource_requirements(service),
        readiness_probe: service.readiness_probe.as_ref().map(readiness_probe),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            node_selector: (!service.node_selector.is_empty())
                .then(|| service.node_selector.clone()),
            affinity: node_affinity(&service.required_node_labels),
            ..Default::default()
        }),
    }
}

const GPU_RESOURCE: &str = "nvidia.com/gpu";

fn resource_requirements(service: &ServiceDesiredState) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = service.resources.cpu_millicores {
        limits.insert("cpu".to_string(), Quantity(format!("{cpu}m")));
    }
    if let Some(memory) = service.resources.memory_mib {
        limits.insert("memory".to_string(), Quantity(format!("{memory}Mi")));
    }
    if let Some(gpu) = service.resources.gpu_count.filter(|gpu| *gpu > 0) {
        limits.insert(GPU_RESOURCE.to_string(), Quantity(gpu.to_string()));
    }
    (!limits.is_empty()).then(|| ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    })
}

fn readiness_probe(probe: &ProbeSpec) -> Probe {
    let mut kube_probe = Probe {
        initial_delay_seconds: Some(probe.initial_delay_seconds),
        period_seconds: Some(probe.period_seconds),
        success_threshold: Some(probe.success_threshold),
        timeout_seconds: Some(probe.timeout_seconds),
        failure_threshold: Some(probe.failure_threshold),
        ..Default::default()
    };
    match &probe.action {
        ProbeAction::Tcp { port } => {
            kube_probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(*port),
                ..Default::default()
            });
        }
        ProbeAction::Http { port, path } => {
            kube_probe.http_get = Some(HTTPGetAction {
                port: IntOrString::Int(*port),
                path: Some(path.clone()),
                ..Default::default()
            });
        }
    }
    kube_probe
}

fn node_affinity(required: &BTreeMap<String, String>) -> Option<Affinity> {
    if required.is_empty() {
        return None;
    }
    let expressions = required
        .iter()
        .map(|(key, value)| NodeSelectorRequirement {
            key: key.clone(),
            operator: "In".to_string(),
            values: Some(vec![value.clone()]),
        })
        .collect();

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(expressions),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::services::stateless_service;

    #[test]
    fn test_generated_names_are_unique() {
        let service = stateless_service("s1", "web", 2);
        let a = resource_name(&service, ResourceKind::ReplicationController);
        let b = resource_name(&service, ResourceKind::ReplicationController);
        assert_ne!(a, b);
        assert!(a.starts_with("web-"));
        assert_eq!(resource_name(&service, ResourceKind::StatefulSet), "web");
    }

    #[test]
    fn test_selector_pins_workload() {
        let service = stateless_service("s1", "web", 2);
        let spec = workload_spec(&service, ResourceKind::ReplicationController, "web-1", 0);

        assert_eq!(spec.selector.get(labels::WORKLOAD).map(String::as_str), Some("web-1"));
        assert_eq!(spec.selector.get(labels::NAME).map(String::as_str), Some("web"));
        assert_eq!(spec.replicas, 0);
        assert!(spec.service_name.is_none());

        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels.get(labels::VERSION).map(String::as_str), Some("v1"));
    }

    #[test]
    fn test_service_selects_every_generation() {
        let service = stateless_service("s1", "web", 2);
        let selector = service_spec(&service).selector;

        assert_eq!(selector.get(labels::NAME).map(String::as_str), Some("web"));
        assert!(!selector.contains_key(labels::VERSION));
        assert!(!selector.contains_key(labels::WORKLOAD));
    }

    #[test]
    fn test_limits_include_gpus_when_requested() {
        let mut service = stateless_service("s1", "web", 1);
        let limits = resource_requirements(&service).unwrap().limits.unwrap();
        assert_eq!(limits.get("cpu"), Some(&Quantity("250m".to_string())));
        assert!(!limits.contains_key(GPU_RESOURCE));

        service.resources.gpu_count = Some(2);
        let limits = resource_requirements(&service).unwrap().limits.unwrap();
        assert_eq!(limits.get(GPU_RESOURCE), Some(&Quantity("2".to_string())));
    }

    #[test]
    fn test_stateful_service_is_headless() {
        let mut service = stateless_service("s1", "db", 1);
        service.kind = WorkloadKind::Stateful;
        assert!(service_spec(&service).headless);
        assert!(!service_spec(&stateless_service("s2", "web", 1)).headless);
    }
}
