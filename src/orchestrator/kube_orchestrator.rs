//! kube-rs implementation of the orchestrator API

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Pod, ReplicationController, ReplicationControllerSpec, Service as KubeService,
    ServicePort, ServiceSpec as KubeServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

use super::{
    EventStream, Orchestrator, OrchestratorError, OrchestratorResult, PodEvent, ServiceSpec,
    WatchEvent, WorkloadEvent, WorkloadSpec, WorkloadState,
};
use crate::config::KubernetesConfig;
use crate::models::ResourceKind;

/// Orchestrator backed by a Kubernetes API server
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from an explicit kubeconfig or the inferred environment
    pub async fn from_config(config: &KubernetesConfig) -> OrchestratorResult<Self> {
        let kube_config = match &config.kubeconfig_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    OrchestratorError::api("read kubeconfig", format!("{path}: {e}"))
                })?;
                let options = KubeConfigOptions {
                    context: config.context.clone(),
                    cluster: None,
                    user: None,
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| OrchestratorError::api("load kubeconfig", e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| OrchestratorError::api("infer kubeconfig", e.to_string()))?,
        };

        let client = Client::try_from(kube_config)
            .map_err(|e| OrchestratorError::api("create client", e.to_string()))?;

        info!(namespace = %config.namespace, "Kubernetes client created");
        Ok(Self::new(client, config.namespace.clone()))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn create_object<K>(&self, kind: &str, name: &str, object: &K) -> OrchestratorResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_kube_error(e, "create", kind, name))?;
        info!(kind = %kind, name = %name, "Resource created");
        Ok(())
    }

    async fn get_object<K>(&self, kind: &str, name: &str) -> OrchestratorResult<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, "get", kind, name))
    }

    async fn patch_object<K>(
        &self,
        kind: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> OrchestratorResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| map_kube_error(e, "patch", kind, name))?;
        Ok(())
    }

    async fn delete_object<K>(
        &self,
        kind: &str,
        name: &str,
        params: &DeleteParams,
    ) -> OrchestratorResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .delete(name, params)
            .await
            .map_err(|e| map_kube_error(e, "delete", kind, name))?;
        debug!(kind = %kind, name = %name, "Resource deleted");
        Ok(())
    }

    async fn watch_objects<K>(
        &self,
        params: WatchParams,
    ) -> OrchestratorResult<EventStream<WatchEvent<K>>>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + 'static,
        <K as Resource>::DynamicType: Default,
    {
        // resourceVersion "0" replays current objects as Added
        let stream = self
            .api::<K>()
            .watch(&params, "0")
            .await
            .map_err(|e| OrchestratorError::watch(e.to_string()))?
            .boxed();

        let events = stream
            .map_err(|e| OrchestratorError::watch(e.to_string()))
            .try_filter_map(|event| async move {
                Ok(match event {
                    kube::api::WatchEvent::Added(o) => Some(WatchEvent::Added(o)),
                    kube::api::WatchEvent::Modified(o) => Some(WatchEvent::Modified(o)),
                    kube::api::WatchEvent::Deleted(o) => Some(WatchEvent::Deleted(o)),
                    kube::api::WatchEvent::Bookmark(_) => None,
                    kube::api::WatchEvent::Error(e) => {
                        return Err(OrchestratorError::watch(format!("{e:?}")))
                    }
                })
            });

        Ok(events.boxed())
    }
}

fn map_kube_error(err: kube::Error, operation: &str, kind: &str, name: &str) -> OrchestratorError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => OrchestratorError::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 => OrchestratorError::already_exists(kind, name),
        other => OrchestratorError::api(format!("{operation} {kind} {name}"), other.to_string()),
    }
}

fn object_meta(name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn stateful_set(spec: &WorkloadSpec) -> StatefulSet {
    StatefulSet {
        metadata: object_meta(&spec.name, &spec.labels),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(spec.selector.clone()),
                ..Default::default()
            },
            service_name: spec.service_name.clone().unwrap_or_default(),
            template: spec.template.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment(spec: &WorkloadSpec) -> Deployment {
    Deployment {
        metadata: object_meta(&spec.name, &spec.labels),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(spec.selector.clone()),
                ..Default::default()
            },
            template: spec.template.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn replication_controller(spec: &WorkloadSpec) -> ReplicationController {
    ReplicationController {
        metadata: object_meta(&spec.name, &spec.labels),
        spec: Some(ReplicationControllerSpec {
            replicas: Some(spec.replicas),
            selector: Some(spec.selector.clone()),
            template: Some(spec.template.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reduce a native workload object to the fields the controller reads
pub trait ToWorkloadState {
    fn to_workload_state(&self) -> WorkloadState;
}

impl ToWorkloadState for StatefulSet {
    fn to_workload_state(&self) -> WorkloadState {
        WorkloadState {
            name: self.metadata.name.clone().unwrap_or_default(),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            spec_replicas: self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            status_replicas: self.status.as_ref().map(|s| s.replicas).unwrap_or(0),
            ready_replicas: self
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}

impl ToWorkloadState for Deployment {
    fn to_workload_state(&self) -> WorkloadState {
        WorkloadState {
            name: self.metadata.name.clone().unwrap_or_default(),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            spec_replicas: self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            status_replicas: self.status.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            ready_replicas: self
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}

impl ToWorkloadState for ReplicationController {
    fn to_workload_state(&self) -> WorkloadState {
        WorkloadState {
            name: self.metadata.name.clone().unwrap_or_default(),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            spec_replicas: self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            status_replicas: self.status.as_ref().map(|s| s.replicas).unwrap_or(0),
            ready_replicas: self
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}

fn map_workload_events<K>(stream: EventStream<WatchEvent<K>>) -> EventStream<WorkloadEvent>
where
    K: ToWorkloadState + Send + 'static,
{
    stream
        .map_ok(|event| match event {
            WatchEvent::Added(o) => WatchEvent::Added(o.to_workload_state()),
            WatchEvent::Modified(o) => WatchEvent::Modified(o.to_workload_state()),
            WatchEvent::Deleted(o) => WatchEvent::Deleted(o.to_workload_state()),
        })
        .boxed()
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_workload(&self, spec: &WorkloadSpec) -> OrchestratorResult<()> {
        let kind = spec.kind.as_str();
        match spec.kind {
            ResourceKind::StatefulSet => {
                self.create_object(kind, &spec.name, &stateful_set(spec))
                    .await
            }
            ResourceKind::Deployment => {
                self.create_object(kind, &spec.name, &deployment(spec)).await
            }
            ResourceKind::ReplicationController => {
                self.create_object(kind, &spec.name, &replication_controller(spec))
                    .await
            }
        }
    }

    async fn get_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<Option<WorkloadState>> {
        let state = match kind {
            ResourceKind::StatefulSet => self
                .get_object::<StatefulSet>(kind.as_str(), name)
                .await?
                .map(|o| o.to_workload_state()),
            ResourceKind::Deployment => self
                .get_object::<Deployment>(kind.as_str(), name)
                .await?
                .map(|o| o.to_workload_state()),
            ResourceKind::ReplicationController => self
                .get_object::<ReplicationController>(kind.as_str(), name)
                .await?
                .map(|o| o.to_workload_state()),
        };
        Ok(state)
    }

    async fn scale_workload(
        &self,
        kind: ResourceKind,
        name: &str,
        replicas: i32,
    ) -> OrchestratorResult<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        match kind {
            ResourceKind::StatefulSet => {
                self.patch_object::<StatefulSet>(kind.as_str(), name, patch)
                    .await
            }
            ResourceKind::Deployment => {
                self.patch_object::<Deployment>(kind.as_str(), name, patch)
                    .await
            }
            ResourceKind::ReplicationController => {
                self.patch_object::<ReplicationController>(kind.as_str(), name, patch)
                    .await
            }
        }?;
        debug!(kind = %kind, name = %name, replicas = replicas, "Replicas patched");
        Ok(())
    }

    async fn delete_workload(&self, kind: ResourceKind, name: &str) -> OrchestratorResult<()> {
        let params = DeleteParams::background();
        match kind {
            ResourceKind::StatefulSet => {
                self.delete_object::<StatefulSet>(kind.as_str(), name, &params)
                    .await
            }
            ResourceKind::Deployment => {
                self.delete_object::<Deployment>(kind.as_str(), name, &params)
                    .await
            }
            ResourceKind::ReplicationController => {
                self.delete_object::<ReplicationController>(kind.as_str(), name, &params)
                    .await
            }
        }
    }

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()> {
        let ports = spec
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(p.name.clone()),
                port: p.port,
                protocol: Some(p.protocol.clone()),
                target_port: Some(IntOrString::Int(p.port)),
                ..Default::default()
            })
            .collect();

        let service = KubeService {
            metadata: object_meta(&spec.name, &spec.labels),
            spec: Some(KubeServiceSpec {
                selector: Some(spec.selector.clone()),
                ports: Some(ports),
                cluster_ip: spec.headless.then(|| "None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_object("Service", &spec.name, &service).await
    }

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()> {
        self.delete_object::<KubeService>("Service", name, &DeleteParams::default())
            .await
    }

    async fn update_service_selector(
        &self,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()> {
        let patch = json!({ "spec": { "selector": selector } });
        self.patch_object::<KubeService>("Service", name, patch)
            .await
    }

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.delete_object::<Pod>("Pod", name, &params).await
    }

    async fn watch_pods(&self, label_selector: &str) -> OrchestratorResult<EventStream<PodEvent>> {
        self.watch_objects::<Pod>(WatchParams::default().labels(label_selector))
            .await
    }

    async fn watch_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<EventStream<WorkloadEvent>> {
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let stream = match kind {
            ResourceKind::StatefulSet => {
                map_workload_events(self.watch_objects::<StatefulSet>(params).await?)
            }
            ResourceKind::Deployment => {
                map_workload_events(self.watch_objects::<Deployment>(params).await?)
            }
            ResourceKind::ReplicationController => {
                map_workload_events(self.watch_objects::<ReplicationController>(params).await?)
            }
        };
        Ok(stream)
    }
}
