//! # Orchestrator API
//!
//! The narrow set of container orchestrator calls the workload controller
//! issues. [`KubeOrchestrator`] implements it on kube-rs; tests use an
//! in-memory fake.

pub mod kube_orchestrator;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::ResourceKind;

pub use kube_orchestrator::KubeOrchestrator;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Orchestrator API error during {operation}: {message}")]
    Api { operation: String, message: String },

    #[error("Watch error: {message}")]
    Watch { message: String },
}

impl OrchestratorError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn watch(message: impl Into<String>) -> Self {
        Self::Watch {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Watch event delivered by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

pub type PodEvent = WatchEvent<Pod>;
pub type WorkloadEvent = WatchEvent<WorkloadState>;

pub type EventStream<T> = BoxStream<'static, OrchestratorResult<T>>;

/// A workload resource to create
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub replicas: i32,
    /// Headless service backing a StatefulSet
    pub service_name: Option<String>,
    pub template: PodTemplateSpec,
}

/// Summary of a live workload resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadState {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub spec_replicas: i32,
    pub status_replicas: i32,
    pub ready_replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

/// A network-facing Service to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePortSpec>,
    pub headless: bool,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_workload(&self, spec: &WorkloadSpec) -> OrchestratorResult<()>;

    async fn get_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<Option<WorkloadState>>;

    /// Patch `spec.replicas` of a workload
    async fn scale_workload(
        &self,
        kind: ResourceKind,
        name: &str,
        replicas: i32,
    ) -> OrchestratorResult<()>;

    /// Delete a workload; `NotFound` when it does not exist
    async fn delete_workload(&self, kind: ResourceKind, name: &str) -> OrchestratorResult<()>;

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()>;

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()>;

    /// Re-point a Service at a new set of pod labels
    async fn update_service_selector(
        &self,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()>;

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()>;

    /// Watch pods matching a label selector, starting with the current pods
    async fn watch_pods(&self, label_selector: &str) -> OrchestratorResult<EventStream<PodEvent>>;

    /// Watch a single workload resource
    async fn watch_workload(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> OrchestratorResult<EventStream<WorkloadEvent>>;
}
