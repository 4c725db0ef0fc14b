//! In-memory orchestrator that records every call and simulates pods

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::pods::{pod_with_labels, PodState};
use crate::models::ResourceKind;
use crate::orchestrator::{
    EventStream, Orchestrator, OrchestratorError, OrchestratorResult, PodEvent, ServiceSpec,
    WatchEvent, WorkloadEvent, WorkloadSpec, WorkloadState,
};

/// A call made against the fake, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    CreateWorkload {
        kind: ResourceKind,
        name: String,
        replicas: i32,
    },
    ScaleWorkload {
        kind: ResourceKind,
        name: String,
        replicas: i32,
    },
    DeleteWorkload {
        kind: ResourceKind,
        name: String,
    },
    CreateService {
        name: String,
    },
    DeleteService {
        name: String,
    },
    UpdateServiceSelector {
        name: String,
        selector: BTreeMap<String, String>,
    },
    DeletePod {
        name: String,
    },
}

/// How the fake kubelet reacts to replica changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodBehavior {
    /// Pods appear and disappear immediately, in the given state
    Auto(PodState),
    /// Nothing happens until the test spawns or removes pods
    Manual,
}

struct FakeWorkload {
    kind: ResourceKind,
    labels: BTreeMap<String, String>,
    replicas: i32,
    pods: Vec<String>,
    next_ordinal: u32,
}

struct PodWatcher {
    selector: BTreeMap<String, String>,
    tx: UnboundedSender<OrchestratorResult<PodEvent>>,
}

struct WorkloadWatcher {
    name: String,
    tx: UnboundedSender<OrchestratorResult<WorkloadEvent>>,
}

struct FakeState {
    behavior: PodBehavior,
    workloads: BTreeMap<String, FakeWorkload>,
    services: BTreeMap<String, ServiceSpec>,
    pods: BTreeMap<String, (Pod, PodState)>,
    pod_watchers: Vec<PodWatcher>,
    workload_watchers: Vec<WorkloadWatcher>,
    calls: Vec<FakeCall>,
    failures: HashMap<&'static str, String>,
    /// Endpoint count per Service after every scale or delete
    endpoint_history: Vec<(String, usize)>,
}

pub struct FakeOrchestrator {
    state: Mutex<FakeState>,
}

impl Default for FakeOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn selects(selector: &BTreeMap<String, String>, pod: &Pod) -> bool {
    let Some(pod_labels) = pod.metadata.labels.as_ref() else {
        return selector.is_empty();
    };
    selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
}

impl FakeState {
    fn take_failure(&mut self, operation: &'static str) -> OrchestratorResult<()> {
        match self.failures.remove(operation) {
            Some(message) => Err(OrchestratorError::api(operation, message)),
            None => Ok(()),
        }
    }

    fn emit_pod(&mut self, event: PodEvent) {
        let pod = match &event {
            WatchEvent::Added(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
        };
        self.pod_watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.pod_watchers {
            if selects(&watcher.selector, pod) {
                let _ = watcher.tx.unbounded_send(Ok(event.clone()));
            }
        }
    }

    fn workload_state(&self, name: &str) -> Option<WorkloadState> {
        let workload = self.workloads.get(name)?;
        let ready = workload
            .pods
            .iter()
            .filter(|p| self.pods.get(*p).is_some_and(|(_, state)| state.is_ready()))
            .count();
        Some(WorkloadState {
            name: name.to_string(),
            labels: workload.labels.clone(),
            spec_replicas: workload.replicas,
            status_replicas: workload.pods.len() as i32,
            ready_replicas: ready as i32,
        })
    }

    fn emit_workload(&mut self, name: &str) {
        let Some(state) = self.workload_state(name) else {
            return;
        };
        self.workload_watchers.retain(|w| !w.tx.is_closed());
        for watcher in self.workload_watchers.iter().filter(|w| w.name == name) {
            let _ = watcher
                .tx
                .unbounded_send(Ok(WatchEvent::Modified(state.clone())));
        }
    }

    fn spawn_pod(&mut self, workload_name: &str, pod_state: PodState) -> Option<String> {
        let workload = self.workloads.get_mut(workload_name)?;
        let pod_name = format!("{workload_name}-{}", workload.next_ordinal);
        workload.next_ordinal += 1;
        workload.pods.push(pod_name.clone());
        let pod = pod_with_labels(&pod_name, workload.labels.clone(), pod_state);

        self.pods.insert(pod_name.clone(), (pod.clone(), pod_state));
        self.emit_pod(WatchEvent::Added(pod));
        Some(pod_name)
    }

    fn remove_pod(&mut self, pod_name: &str) -> bool {
        let Some((pod, _)) = self.pods.remove(pod_name) else {
            return false;
        };
        for workload in self.workloads.values_mut() {
            workload.pods.retain(|p| p != pod_name);
        }
        self.emit_pod(WatchEvent::Deleted(pod));
        true
    }

    /// Ready pods a Service routes to
    fn endpoints(&self, service_name: &str) -> Vec<String> {
        let Some(service) = self.services.get(service_name) else {
            return Vec::new();
        };
        self.pods
            .iter()
            .filter(|(_, (pod, pod_state))| pod_state.is_ready() && selects(&service.selector, pod))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn record_endpoints(&mut self) {
        let counts: Vec<(String, usize)> = self
            .services
            .keys()
            .map(|name| (name.clone(), self.endpoints(name).len()))
            .collect();
        self.endpoint_history.extend(counts);
    }

    fn reconcile(&mut self, name: &str) {
        let PodBehavior::Auto(pod_state) = self.behavior else {
            return;
        };
        loop {
            let Some(workload) = self.workloads.get(name) else {
                return;
            };
            let live = workload.pods.len() as i32;
            if live < workload.replicas {
                self.spawn_pod(name, pod_state);
            } else if live > workload.replicas {
                if let Some(last) = workload.pods.last().cloned() {
                    self.remove_pod(&last);
                }
            } else {
                return;
            }
        }
    }
}

impl FakeOrchestrator {
    /// Fake whose pods become ready as soon as they are created
    pub fn new() -> Self {
        Self::with_behavior(PodBehavior::Auto(PodState::Ready))
    }

    pub fn with_behavior(behavior: PodBehavior) -> Self {
        Self {
            state: Mutex::new(FakeState {
                behavior,
                workloads: BTreeMap::new(),
                services: BTreeMap::new(),
                pods: BTreeMap::new(),
                pod_watchers: Vec::new(),
                workload_watchers: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                endpoint_history: Vec::new(),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: PodBehavior) {
        self.state.lock().behavior = behavior;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Fail the next call of `operation` (the trait method name) with an API error
    pub fn fail_next(&self, operation: &'static str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(operation, message.to_string());
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.state.lock().workloads.keys().cloned().collect()
    }

    pub fn workload_replicas(&self, name: &str) -> Option<i32> {
        self.state.lock().workloads.get(name).map(|w| w.replicas)
    }

    pub fn workload_kind(&self, name: &str) -> Option<ResourceKind> {
        self.state.lock().workloads.get(name).map(|w| w.kind)
    }

    pub fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.state.lock().services.get(name).cloned()
    }

    /// Ready pods the Service `name` currently routes to
    pub fn endpoints(&self, name: &str) -> Vec<String> {
        self.state.lock().endpoints(name)
    }

    /// Endpoint counts of Service `name`, one per scale or delete call
    pub fn endpoint_history(&self, name: &str) -> Vec<usize> {
        self.state
            .lock()
            .endpoint_history
            .iter()
            .filter(|(service, _)| service == name)
            .map(|(_, count)| *count)
            .collect()
    }

    pub fn pods_of(&self, workload_name: &str) -> Vec<String> {
        self.state
            .lock()
            .workloads
            .get(workload_name)
            .map(|w| w.pods.clone())
            .unwrap_or_default()
    }

    pub fn pod_count(&self) -> usize {
        self.state.lock().pods.len()
    }

    /// Add a pod to a workload, as the kubelet would
    pub fn spawn_pod(&self, workload_name: &str, pod_state: PodState) -> Option<String> {
        self.state.lock().spawn_pod(workload_name, pod_state)
    }

    /// Register a pod that belongs to no workload
    pub fn insert_pod(&self, pod: Pod, pod_state: PodState) {
        let mut state = self.state.lock();
        let name = pod.metadata.name.clone().unwrap_or_default();
        state.pods.insert(name, (pod.clone(), pod_state));
        state.emit_pod(WatchEvent::Added(pod));
    }

    /// Remove a pod, as the kubelet would after a scale down
    pub fn remove_pod(&self, pod_name: &str) -> bool {
        self.state.lock().remove_pod(pod_name)
    }

    /// Open pod watches
    pub fn pod_watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.pod_watchers.retain(|w| !w.tx.is_closed());
        state.pod_watchers.len()
    }

    /// End every open pod watch, as an API server closing the stream would
    pub fn close_pod_watches(&self) {
        self.state.lock().pod_watchers.clear();
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_workload(&self, spec: &WorkloadSpec) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::CreateWorkload {
            kind: spec.kind,
            name: spec.name.clone(),
            replicas: spec.replicas,
        });
        state.take_failure("create_workload")?;

        if state.workloads.contains_key(&spec.name) {
            return Err(OrchestratorError::already_exists(
                spec.kind.as_str(),
                &spec.name,
            ));
        }
        let labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_else(|| spec.labels.clone());
        state.workloads.insert(
            spec.name.clone(),
            FakeWorkload {
                kind: spec.kind,
                labels,
                replicas: spec.replicas,
                pods: Vec::new(),
                next_ordinal: 0,
            },
        );
        state.reconcile(&spec.name);
        Ok(())
    }

    async fn get_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<Option<WorkloadState>> {
        let mut state = self.state.lock();
        state.take_failure("get_workload")?;
        if state.workloads.get(name).is_some_and(|w| w.kind != kind) {
            return Ok(None);
        }
        Ok(state.workload_state(name))
    }

    async fn scale_workload(
        &self,
        kind: ResourceKind,
        name: &str,
        replicas: i32,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::ScaleWorkload {
            kind,
            name: name.to_string(),
            replicas,
        });
        state.take_failure("scale_workload")?;

        let workload = state
            .workloads
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::not_found(kind.as_str(), name))?;
        workload.replicas = replicas;
        state.reconcile(name);
        state.emit_workload(name);
        state.record_endpoints();
        Ok(())
    }

    async fn delete_workload(&self, kind: ResourceKind, name: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::DeleteWorkload {
            kind,
            name: name.to_string(),
        });
        state.take_failure("delete_workload")?;

        let workload = state
            .workloads
            .remove(name)
            .ok_or_else(|| OrchestratorError::not_found(kind.as_str(), name))?;
        for pod in workload.pods {
            if let Some((pod, _)) = state.pods.remove(&pod) {
                state.emit_pod(WatchEvent::Deleted(pod));
            }
        }
        state.record_endpoints();
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::CreateService {
            name: spec.name.clone(),
        });
        state.take_failure("create_service")?;

        if state.services.contains_key(&spec.name) {
            return Err(OrchestratorError::already_exists("Service", &spec.name));
        }
        state.services.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::DeleteService {
            name: name.to_string(),
        });
        state.take_failure("delete_service")?;

        state
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::not_found("Service", name))
    }

    async fn update_service_selector(
        &self,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::UpdateServiceSelector {
            name: name.to_string(),
            selector: selector.clone(),
        });
        state.take_failure("update_service_selector")?;

        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::not_found("Service", name))?;
        service.selector = selector.clone();
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::DeletePod {
            name: name.to_string(),
        });
        state.take_failure("delete_pod")?;

        if state.remove_pod(name) {
            Ok(())
        } else {
            Err(OrchestratorError::not_found("Pod", name))
        }
    }

    async fn watch_pods(&self, label_selector: &str) -> OrchestratorResult<EventStream<PodEvent>> {
        let mut state = self.state.lock();
        state.take_failure("watch_pods")?;

        let selector = parse_selector(label_selector);
        let (tx, rx) = unbounded();
        for (pod, _) in state.pods.values() {
            if selects(&selector, pod) {
                let _ = tx.unbounded_send(Ok(WatchEvent::Added(pod.clone())));
            }
        }
        state.pod_watchers.push(PodWatcher { selector, tx });
        Ok(rx.boxed())
    }

    async fn watch_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<EventStream<WorkloadEvent>> {
        let mut state = self.state.lock();
        state.take_failure("watch_workload")?;

        let (tx, rx) = unbounded();
        if state.workloads.get(name).is_some_and(|w| w.kind == kind) {
            if let Some(current) = state.workload_state(name) {
                let _ = tx.unbounded_send(Ok(WatchEvent::Added(current)));
            }
        }
        state.workload_watchers.push(WorkloadWatcher {
            name: name.to_string(),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_pods_follow_replicas() {
        let fake = FakeOrchestrator::new();
        let spec = WorkloadSpec {
            kind: ResourceKind::ReplicationController,
            name: "web-1".to_string(),
            labels: BTreeMap::new(),
            selector: BTreeMap::new(),
            replicas: 2,
            service_name: None,
            template: Default::default(),
        };

        fake.create_workload(&spec).await.unwrap();
        assert_eq!(fake.pods_of("web-1").len(), 2);

        fake.scale_workload(ResourceKind::ReplicationController, "web-1", 1)
            .await
            .unwrap();
        assert_eq!(fake.pods_of("web-1"), vec!["web-1-0".to_string()]);

        let state = fake
            .get_workload(ResourceKind::ReplicationController, "web-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.ready_replicas, 1);
    }

    #[test]
    fn test_selector_parsing() {
        let selector = parse_selector("name=web, version=v1");
        assert_eq!(selector.get("version").map(String::as_str), Some("v1"));
        assert_eq!(selector.len(), 2);
    }
}
