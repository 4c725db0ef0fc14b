//! Service definitions for tests

use std::collections::BTreeMap;

use crate::models::{
    ContainerPort, ProbeAction, ProbeSpec, ResourceLimits, ServiceDesiredState, WorkloadKind,
};

/// A stateless service at deploy version `v1` serving on port 8080
pub fn stateless_service(service_id: &str, alias: &str, replicas: i32) -> ServiceDesiredState {
    ServiceDesiredState {
        tenant_id: "tenant-1".to_string(),
        service_id: service_id.to_string(),
        service_alias: alias.to_string(),
        replicas,
        image: format!("registry.local/{alias}:v1"),
        deploy_version: "v1".to_string(),
        resources: ResourceLimits {
            cpu_millicores: Some(250),
            memory_mib: Some(128),
            gpu_count: None,
        },
        env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
        ports: vec![ContainerPort {
            container_port: 8080,
            protocol: "TCP".to_string(),
            name: Some("http".to_string()),
        }],
        volumes: Vec::new(),
        node_selector: BTreeMap::new(),
        required_node_labels: BTreeMap::new(),
        readiness_probe: Some(ProbeSpec {
            action: ProbeAction::Tcp { port: 8080 },
            initial_delay_seconds: 2,
            period_seconds: 3,
            success_threshold: 1,
            timeout_seconds: 1,
            failure_threshold: 3,
        }),
        kind: WorkloadKind::Stateless,
        parallel_generations: None,
    }
}

pub fn stateful_service(service_id: &str, alias: &str, replicas: i32) -> ServiceDesiredState {
    ServiceDesiredState {
        kind: WorkloadKind::Stateful,
        ..stateless_service(service_id, alias, replicas)
    }
}
