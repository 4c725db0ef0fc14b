//! Lifecycle tasks run through the executor against in-memory collaborators

mod common;

use serde_json::json;
use std::time::Duration;

use common::created_workloads;
use workload_worker::config::TimeoutPolicy;
use workload_worker::models::ResourceKind;
use workload_worker::test_helpers::services::{stateful_service, stateless_service};
use workload_worker::test_helpers::{
    test_config, FakeCall, FakeOrchestrator, Harness, PodBehavior, StatusCall,
};
use workload_worker::{build_worker, ServiceStatus, Task, TaskExecutor, TaskMessage};

/// Submit one task and wait until its worker has deregistered.
///
/// Polls on one-second ticks of paused time so timed out waits get to fire.
async fn run_task(h: &Harness, task_type: &str, body: serde_json::Value) {
    let task = Task::from_message(&TaskMessage::new(task_type, body).with_event_id("ev-1"));
    let worker = build_worker(&task, h.controller.clone()).expect("known task type");

    let executor = TaskExecutor::with_limit(4);
    executor.add_task(worker).await.unwrap();

    for _ in 0..3_600 {
        if executor.worker_count().await == 0 {
            executor.stop().await;
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("task did not finish");
}

fn body(service_id: &str) -> serde_json::Value {
    json!({"tenant_id": "tenant-1", "service_id": service_id})
}

#[tokio::test(start_paused = true)]
async fn test_start_publishes_starting_then_running() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);

    run_task(&h, "start", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![ServiceStatus::Starting, ServiceStatus::Running]
    );
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        h.orchestrator.workload_replicas(&records[0].resource_name),
        Some(2)
    );
    assert!(h.orchestrator.service("web").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_start_of_stateful_service_creates_service_first() {
    let h = Harness::new();
    let service = stateful_service("svc-1", "db", 1);
    h.register(&service);

    run_task(&h, "start", body("svc-1")).await;

    let calls = h.orchestrator.calls();
    assert!(matches!(calls[0], FakeCall::CreateService { .. }));
    assert!(matches!(
        calls[1],
        FakeCall::CreateWorkload {
            kind: ResourceKind::StatefulSet,
            ..
        }
    ));
    assert_eq!(h.orchestrator.workload_kind("db"), Some(ResourceKind::StatefulSet));
    assert!(h.orchestrator.service("db").is_some_and(|s| s.headless));
}

#[tokio::test(start_paused = true)]
async fn test_start_over_running_service_is_rejected() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    h.orchestrator.clear_calls();

    run_task(&h, "start", body("svc-1")).await;

    assert!(h.orchestrator.calls().is_empty());
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Running));
    assert!(h
        .status
        .calls()
        .contains(&StatusCall::Check("svc-1".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_is_torn_down() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);
    h.orchestrator.fail_next("create_workload", "quota exceeded");

    run_task(&h, "start", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![ServiceStatus::Starting, ServiceStatus::Closed]
    );
    assert!(h.store.records().is_empty());
    assert!(h.orchestrator.workload_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_defers_status_under_continue_policy() {
    let h = Harness::with(
        FakeOrchestrator::with_behavior(PodBehavior::Manual),
        test_config(),
    );
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);

    run_task(&h, "start", body("svc-1")).await;

    // The workload stays deployed; the status service settles the outcome
    assert_eq!(h.status.published("svc-1"), vec![ServiceStatus::Starting]);
    assert!(h
        .status
        .calls()
        .contains(&StatusCall::Check("svc-1".to_string())));
    assert_eq!(h.store.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_fails_under_fail_policy() {
    let mut config = test_config();
    config.timeouts.start = TimeoutPolicy::Fail;
    let h = Harness::with(FakeOrchestrator::with_behavior(PodBehavior::Manual), config);
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);

    run_task(&h, "start", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![ServiceStatus::Starting, ServiceStatus::Closed]
    );
    assert!(h.store.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_and_removes_everything() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    let name = h.store.records()[0].resource_name.clone();
    h.store.add_pod("svc-1", &name, "stray-pod");

    run_task(&h, "stop", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![
            ServiceStatus::Starting,
            ServiceStatus::Running,
            ServiceStatus::Stopping,
            ServiceStatus::Closed
        ]
    );
    assert!(h.orchestrator.workload_names().is_empty());
    assert!(h.orchestrator.service("web").is_none());
    assert!(h.store.records().is_empty());
    assert!(h.store.pods().is_empty());
    assert_eq!(h.orchestrator.pod_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_of_undeployed_service_succeeds() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);

    run_task(&h, "stop", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![ServiceStatus::Stopping, ServiceStatus::Closed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_stateful_service_stops_then_starts() {
    let h = Harness::new();
    let service = stateful_service("svc-1", "db", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    h.orchestrator.clear_calls();

    run_task(&h, "restart", body("svc-1")).await;

    let calls = h.orchestrator.calls();
    let deleted = calls
        .iter()
        .position(|c| matches!(c, FakeCall::DeleteWorkload { name, .. } if name == "db"))
        .expect("old StatefulSet deleted");
    let created = calls
        .iter()
        .position(|c| matches!(c, FakeCall::CreateWorkload { name, .. } if name == "db"))
        .expect("StatefulSet recreated");
    assert!(deleted < created);

    let published = h.status.published("svc-1");
    assert_eq!(
        &published[2..],
        &[
            ServiceStatus::Upgrade,
            ServiceStatus::Starting,
            ServiceStatus::Running
        ]
    );
    assert_eq!(h.orchestrator.workload_replicas("db"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_replication_controller_rolls_over() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    let old = h.store.records()[0].resource_name.clone();
    h.orchestrator.clear_calls();

    run_task(&h, "restart", body("svc-1")).await;

    let new = created_workloads(&h.orchestrator.calls()).remove(0);
    assert_ne!(new, old);
    assert_eq!(h.orchestrator.workload_names(), vec![new.clone()]);
    assert!(h
        .orchestrator
        .calls()
        .iter()
        .any(|c| matches!(c, FakeCall::UpdateServiceSelector { name, .. } if name == "web")));
    assert_eq!(
        &h.status.published("svc-1")[2..],
        &[
            ServiceStatus::Upgrade,
            ServiceStatus::Starting,
            ServiceStatus::Running
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_undeployed_service_starts_it() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);

    run_task(&h, "restart", body("svc-1")).await;

    assert_eq!(
        h.status.published("svc-1"),
        vec![
            ServiceStatus::Upgrade,
            ServiceStatus::Starting,
            ServiceStatus::Running
        ]
    );
    assert_eq!(h.store.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_moves_service_to_new_version() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;

    run_task(
        &h,
        "rolling_upgrade",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "new_deploy_version": "v2"}),
    )
    .await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].deploy_version, "v2");
    // The Service selects by name only, so both versions served during the swap
    let selector = h.orchestrator.service("web").unwrap().selector;
    assert_eq!(selector.get("name").map(String::as_str), Some("web"));
    assert!(!selector.contains_key("version"));
    let mut serving = h.orchestrator.endpoints("web");
    let mut new_pods = h.orchestrator.pods_of(&records[0].resource_name);
    serving.sort();
    new_pods.sort();
    assert_eq!(serving, new_pods);
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_of_deployment_is_unsupported() {
    let mut config = test_config();
    config.rollout.stateless_resource = ResourceKind::Deployment;
    let h = Harness::with(FakeOrchestrator::new(), config);
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    h.orchestrator.clear_calls();

    run_task(
        &h,
        "rolling_upgrade",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "new_deploy_version": "v2"}),
    )
    .await;

    assert!(h.orchestrator.calls().is_empty());
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Upgrade));
    assert_eq!(
        h.status.calls().last(),
        Some(&StatusCall::Check("svc-1".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_horizontal_scaling_changes_replicas() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    let name = h.store.records()[0].resource_name.clone();

    run_task(
        &h,
        "horizontal_scaling",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "replicas": 3}),
    )
    .await;

    assert_eq!(h.orchestrator.workload_replicas(&name), Some(3));
    assert_eq!(h.orchestrator.pods_of(&name).len(), 3);
    assert!(!h.status.is_ignoring(&name));
    assert_eq!(
        h.status.published("svc-1"),
        vec![
            ServiceStatus::Starting,
            ServiceStatus::Running,
            ServiceStatus::Upgrade,
            ServiceStatus::Running
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_horizontal_scaling_to_same_count_does_nothing() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    h.orchestrator.clear_calls();

    run_task(
        &h,
        "horizontal_scaling",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "replicas": 2}),
    )
    .await;

    assert!(h.orchestrator.calls().is_empty());
    assert!(!h
        .status
        .calls()
        .iter()
        .any(|c| matches!(c, StatusCall::IgnoreDelete(_))));
}

#[tokio::test(start_paused = true)]
async fn test_image_outside_prefix_is_rejected() {
    let mut config = test_config();
    config.kubernetes.image_prefix = Some("registry.internal/".to_string());
    let h = Harness::with(FakeOrchestrator::new(), config);
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);

    run_task(&h, "start", body("svc-1")).await;

    assert!(h.orchestrator.workload_names().is_empty());
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Closed));
    assert!(created_workloads(&h.orchestrator.calls()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_vertical_scaling_saves_limits_and_restarts() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    let old = h.store.records()[0].resource_name.clone();
    h.orchestrator.clear_calls();

    run_task(
        &h,
        "vertical_scaling",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "container_memory": 512, "container_gpu": 1}),
    )
    .await;

    let resources = h.store.service("svc-1").unwrap().resources;
    assert_eq!(resources.memory_mib, Some(512));
    assert_eq!(resources.gpu_count, Some(1));
    assert_eq!(resources.cpu_millicores, Some(250));

    let new = created_workloads(&h.orchestrator.calls()).remove(0);
    assert_ne!(new, old);
    assert_eq!(h.orchestrator.workload_names(), vec![new.clone()]);
    assert_eq!(h.orchestrator.workload_replicas(&new), Some(2));
    assert_eq!(
        &h.status.published("svc-1")[2..],
        &[
            ServiceStatus::Upgrade,
            ServiceStatus::Starting,
            ServiceStatus::Running
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_vertical_scaling_of_closed_service_only_saves_limits() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    h.status.with_status("svc-1", ServiceStatus::Closed);

    run_task(
        &h,
        "vertical_scaling",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "container_cpu": 1000}),
    )
    .await;

    let resources = h.store.service("svc-1").unwrap().resources;
    assert_eq!(resources.cpu_millicores, Some(1000));
    assert_eq!(resources.memory_mib, Some(128));
    assert!(h.orchestrator.calls().is_empty());
    assert!(h.status.published("svc-1").is_empty());
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_rollback_returns_service_to_old_version() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 2);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    run_task(
        &h,
        "rolling_upgrade",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "new_deploy_version": "v2"}),
    )
    .await;
    assert_eq!(h.store.records()[0].deploy_version, "v2");

    run_task(
        &h,
        "rollback",
        json!({
            "tenant_id": "tenant-1",
            "service_id": "svc-1",
            "current_deploy_version": "v2",
            "old_deploy_version": "v1"
        }),
    )
    .await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].deploy_version, "v1");
    assert_eq!(h.orchestrator.workload_names(), vec![records[0].resource_name.clone()]);
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn test_rollback_without_target_version_is_rejected() {
    let h = Harness::new();
    let service = stateless_service("svc-1", "web", 1);
    h.register(&service);
    run_task(&h, "start", body("svc-1")).await;
    h.orchestrator.clear_calls();

    run_task(
        &h,
        "rollback",
        json!({"tenant_id": "tenant-1", "service_id": "svc-1", "old_deploy_version": ""}),
    )
    .await;

    assert!(h.orchestrator.calls().is_empty());
    assert_eq!(h.status.current("svc-1"), Some(ServiceStatus::Running));
    assert_eq!(
        h.status.calls().last(),
        Some(&StatusCall::Check("svc-1".to_string()))
    );
}
