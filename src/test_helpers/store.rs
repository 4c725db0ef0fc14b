//! In-memory workload store

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::database::{StoreError, StoreResult, WorkloadStore};
use crate::models::{PodRecord, ResourceLimits, ServiceDesiredState, WorkloadRecord};

#[derive(Default)]
struct StoreState {
    services: HashMap<String, ServiceDesiredState>,
    type_labels: HashMap<String, String>,
    records: Vec<WorkloadRecord>,
    pods: Vec<PodRecord>,
}

/// Store that keeps everything in memory and enforces one active record per service
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_service(&self, service: ServiceDesiredState) {
        self.state
            .lock()
            .services
            .insert(service.service_id.clone(), service);
    }

    pub fn service(&self, service_id: &str) -> Option<ServiceDesiredState> {
        self.state.lock().services.get(service_id).cloned()
    }

    pub fn set_service_type(&self, service_id: &str, label: &str) {
        self.state
            .lock()
            .type_labels
            .insert(service_id.to_string(), label.to_string());
    }

    pub fn records(&self) -> Vec<WorkloadRecord> {
        self.state.lock().records.clone()
    }

    pub fn insert_record(&self, record: WorkloadRecord) {
        self.state.lock().records.push(record);
    }

    pub fn add_pod(&self, service_id: &str, resource_name: &str, pod_name: &str) {
        self.state.lock().pods.push(PodRecord {
            pod_name: pod_name.to_string(),
            service_id: service_id.to_string(),
            resource_name: resource_name.to_string(),
        });
    }

    pub fn pods(&self) -> Vec<PodRecord> {
        self.state.lock().pods.clone()
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn get_service(&self, service_id: &str) -> StoreResult<ServiceDesiredState> {
        self.state
            .lock()
            .services
            .get(service_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("service", service_id))
    }

    async fn update_service_resources(
        &self,
        service_id: &str,
        resources: &ResourceLimits,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let service = state
            .services
            .get_mut(service_id)
            .ok_or_else(|| StoreError::not_found("service", service_id))?;
        service.resources = resources.clone();
        Ok(())
    }

    async fn service_type_label(&self, service_id: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().type_labels.get(service_id).cloned())
    }

    async fn active_record(&self, service_id: &str) -> StoreResult<Option<WorkloadRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .iter()
            .find(|r| r.service_id == service_id && !r.is_delete)
            .cloned())
    }

    async fn records_for_service(&self, service_id: &str) -> StoreResult<Vec<WorkloadRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn all_records(&self) -> StoreResult<Vec<WorkloadRecord>> {
        Ok(self.state.lock().records.clone())
    }

    async fn add_record(&self, record: &WorkloadRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        if !record.is_delete
            && state
                .records
                .iter()
                .any(|r| r.service_id == record.service_id && !r.is_delete)
        {
            return Err(StoreError::Conflict(format!(
                "service {} already has an active record",
                record.service_id
            )));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn mark_record_deleting(&self, service_id: &str, resource_name: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.service_id == service_id && r.resource_name == resource_name)
            .ok_or_else(|| StoreError::not_found("workload record", resource_name))?;
        record.is_delete = true;
        Ok(())
    }

    async fn delete_record(&self, service_id: &str, resource_name: &str) -> StoreResult<()> {
        self.state
            .lock()
            .records
            .retain(|r| !(r.service_id == service_id && r.resource_name == resource_name));
        Ok(())
    }

    async fn delete_records_for_service(&self, service_id: &str) -> StoreResult<()> {
        self.state
            .lock()
            .records
            .retain(|r| r.service_id != service_id);
        Ok(())
    }

    async fn pods_for_service(&self, service_id: &str) -> StoreResult<Vec<PodRecord>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|p| p.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn pods_for_resource(
        &self,
        service_id: &str,
        resource_name: &str,
    ) -> StoreResult<Vec<PodRecord>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|p| p.service_id == service_id && p.resource_name == resource_name)
            .cloned()
            .collect())
    }

    async fn delete_pod_record(&self, pod_name: &str) -> StoreResult<()> {
        self.state.lock().pods.retain(|p| p.pod_name != pod_name);
        Ok(())
    }
}
