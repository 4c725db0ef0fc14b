//! PostgreSQL implementation of [`WorkloadStore`]

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::debug;

use super::{StoreError, StoreResult, WorkloadStore};
use crate::models::{
    ContainerPort, PodRecord, ProbeSpec, ResourceKind, ResourceLimits, ServiceDesiredState,
    VolumeSpec, WorkloadKind, WorkloadRecord,
};

const SERVICE_TYPE_LABEL_KEY: &str = "service-type";

#[derive(Debug, FromRow)]
struct ServiceRow {
    tenant_id: String,
    service_id: String,
    service_alias: String,
    replicas: i32,
    image: String,
    deploy_version: String,
    cpu_millicores: Option<i64>,
    memory_mib: Option<i64>,
    gpu_count: Option<i64>,
    env: Json<BTreeMap<String, String>>,
    ports: Json<Vec<ContainerPort>>,
    volumes: Json<Vec<VolumeSpec>>,
    node_selector: Json<BTreeMap<String, String>>,
    required_node_labels: Json<BTreeMap<String, String>>,
    readiness_probe: Option<Json<ProbeSpec>>,
    parallel_generations: Option<bool>,
}

impl From<ServiceRow> for ServiceDesiredState {
    fn from(row: ServiceRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            service_id: row.service_id,
            service_alias: row.service_alias,
            replicas: row.replicas,
            image: row.image,
            deploy_version: row.deploy_version,
            resources: ResourceLimits {
                cpu_millicores: row.cpu_millicores,
                memory_mib: row.memory_mib,
                gpu_count: row.gpu_count,
            },
            env: row.env.0,
            ports: row.ports.0,
            volumes: row.volumes.0,
            node_selector: row.node_selector.0,
            required_node_labels: row.required_node_labels.0,
            readiness_probe: row.readiness_probe.map(|p| p.0),
            kind: WorkloadKind::default(),
            parallel_generations: row.parallel_generations,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    tenant_id: String,
    service_id: String,
    resource_name: String,
    resource_kind: String,
    deploy_version: String,
    is_delete: bool,
}

impl TryFrom<RecordRow> for WorkloadRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let resource_kind = row
            .resource_kind
            .parse::<ResourceKind>()
            .map_err(StoreError::Decode)?;
        Ok(Self {
            tenant_id: row.tenant_id,
            service_id: row.service_id,
            resource_name: row.resource_name,
            resource_kind,
            deploy_version: row.deploy_version,
            is_delete: row.is_delete,
        })
    }
}

#[derive(Debug, FromRow)]
struct PodRow {
    pod_name: String,
    service_id: String,
    resource_name: String,
}

impl From<PodRow> for PodRecord {
    fn from(row: PodRow) -> Self {
        Self {
            pod_name: row.pod_name,
            service_id: row.service_id,
            resource_name: row.resource_name,
        }
    }
}

fn decode_records(rows: Vec<RecordRow>) -> StoreResult<Vec<WorkloadRecord>> {
    rows.into_iter().map(WorkloadRecord::try_from).collect()
}

#[derive(Clone)]
pub struct PgWorkloadStore {
    pool: PgPool,
}

impl PgWorkloadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RECORD_COLUMNS: &str =
    "tenant_id, service_id, resource_name, resource_kind, deploy_version, is_delete";

#[async_trait]
impl WorkloadStore for PgWorkloadStore {
    async fn get_service(&self, service_id: &str) -> StoreResult<ServiceDesiredState> {
        let row = sqlx::query_as::<_, ServiceRow>(
            r#"
            SELECT tenant_id, service_id, service_alias, replicas, image, deploy_version,
                   cpu_millicores, memory_mib, gpu_count, env, ports, volumes, node_selector,
                   required_node_labels, readiness_probe, parallel_generations
            FROM tenant_services
            WHERE service_id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceDesiredState::from)
            .ok_or_else(|| StoreError::not_found("service", service_id))
    }

    async fn update_service_resources(
        &self,
        service_id: &str,
        resources: &ResourceLimits,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_services
            SET cpu_millicores = $2, memory_mib = $3, gpu_count = $4
            WHERE service_id = $1
            "#,
        )
        .bind(service_id)
        .bind(resources.cpu_millicores)
        .bind(resources.memory_mib)
        .bind(resources.gpu_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("service", service_id));
        }
        debug!(service_id = %service_id, "Service resources updated");
        Ok(())
    }

    async fn service_type_label(&self, service_id: &str) -> StoreResult<Option<String>> {
        let label = sqlx::query_scalar::<_, String>(
            "SELECT label_value FROM tenant_service_labels WHERE service_id = $1 AND label_key = $2",
        )
        .bind(service_id)
        .bind(SERVICE_TYPE_LABEL_KEY)
        .fetch_optional(&self.pool)
        .await?;
        Ok(label)
    }

    async fn active_record(&self, service_id: &str) -> StoreResult<Option<WorkloadRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_deploy_records WHERE service_id = $1 AND is_delete = false"
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkloadRecord::try_from).transpose()
    }

    async fn records_for_service(&self, service_id: &str) -> StoreResult<Vec<WorkloadRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_deploy_records WHERE service_id = $1"
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        decode_records(rows)
    }

    async fn all_records(&self) -> StoreResult<Vec<WorkloadRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_deploy_records"
        ))
        .fetch_all(&self.pool)
        .await?;
        decode_records(rows)
    }

    async fn add_record(&self, record: &WorkloadRecord) -> StoreResult<()> {
        // A partial unique index on (service_id) WHERE NOT is_delete guards the active record
        let result = sqlx::query(&format!(
            "INSERT INTO service_deploy_records ({RECORD_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(&record.tenant_id)
        .bind(&record.service_id)
        .bind(&record.resource_name)
        .bind(record.resource_kind.as_str())
        .bind(&record.deploy_version)
        .bind(record.is_delete)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    service_id = %record.service_id,
                    resource = %record.resource_name,
                    "Workload record added"
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                StoreError::Conflict(format!("active record exists for {}", record.service_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_record_deleting(&self, service_id: &str, resource_name: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE service_deploy_records SET is_delete = true WHERE service_id = $1 AND resource_name = $2",
        )
        .bind(service_id)
        .bind(resource_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_record(&self, service_id: &str, resource_name: &str) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM service_deploy_records WHERE service_id = $1 AND resource_name = $2",
        )
        .bind(service_id)
        .bind(resource_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_records_for_service(&self, service_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM service_deploy_records WHERE service_id = $1")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pods_for_service(&self, service_id: &str) -> StoreResult<Vec<PodRecord>> {
        let rows = sqlx::query_as::<_, PodRow>(
            "SELECT pod_name, service_id, resource_name FROM service_pods WHERE service_id = $1",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PodRecord::from).collect())
    }

    async fn pods_for_resource(
        &self,
        service_id: &str,
        resource_name: &str,
    ) -> StoreResult<Vec<PodRecord>> {
        let rows = sqlx::query_as::<_, PodRow>(
            "SELECT pod_name, service_id, resource_name FROM service_pods WHERE service_id = $1 AND resource_name = $2",
        )
        .bind(service_id)
        .bind(resource_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PodRecord::from).collect())
    }

    async fn delete_pod_record(&self, pod_name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM service_pods WHERE pod_name = $1")
            .bind(pod_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
