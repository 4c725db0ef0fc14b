//! # Workload Store
//!
//! Read-only lookups of service definitions plus bookkeeping of workload and
//! pod records. [`PgWorkloadStore`] implements it on PostgreSQL.

pub mod connection;
pub mod pg_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{PodRecord, ResourceLimits, ServiceDesiredState, WorkloadRecord};

pub use connection::DatabaseConnection;
pub use pg_store::PgWorkloadStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_service(&self, service_id: &str) -> StoreResult<ServiceDesiredState>;

    /// Persist new container limits for a service
    async fn update_service_resources(
        &self,
        service_id: &str,
        resources: &ResourceLimits,
    ) -> StoreResult<()>;

    /// Service type label used to resolve the workload kind
    async fn service_type_label(&self, service_id: &str) -> StoreResult<Option<String>>;

    /// The record with `is_delete == false`, if any
    async fn active_record(&self, service_id: &str) -> StoreResult<Option<WorkloadRecord>>;

    async fn records_for_service(&self, service_id: &str) -> StoreResult<Vec<WorkloadRecord>>;

    async fn all_records(&self) -> StoreResult<Vec<WorkloadRecord>>;

    /// Insert a record; a second active record for one service is a conflict
    async fn add_record(&self, record: &WorkloadRecord) -> StoreResult<()>;

    async fn mark_record_deleting(&self, service_id: &str, resource_name: &str) -> StoreResult<()>;

    async fn delete_record(&self, service_id: &str, resource_name: &str) -> StoreResult<()>;

    async fn delete_records_for_service(&self, service_id: &str) -> StoreResult<()>;

    async fn pods_for_service(&self, service_id: &str) -> StoreResult<Vec<PodRecord>>;

    async fn pods_for_resource(
        &self,
        service_id: &str,
        resource_name: &str,
    ) -> StoreResult<Vec<PodRecord>>;

    async fn delete_pod_record(&self, pod_name: &str) -> StoreResult<()>;
}
