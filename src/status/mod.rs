//! # Status Sync Client
//!
//! Interface to the cluster-status service that owns the externally visible
//! status of each service. [`HttpStatusClient`] talks to it over HTTP.

pub mod http_client;

use async_trait::async_trait;
use thiserror::Error;

use crate::constants::ServiceStatus;

pub use http_client::HttpStatusClient;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Status service request {operation} failed: {message}")]
    Request { operation: String, message: String },

    #[error("No status service endpoints configured")]
    NoEndpoints,

    #[error("Unexpected status response: {0}")]
    Decode(String),
}

impl StatusError {
    pub fn request(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type StatusResult<T> = Result<T, StatusError>;

#[async_trait]
pub trait StatusSyncClient: Send + Sync {
    async fn set_status(&self, service_id: &str, status: ServiceStatus) -> StatusResult<()>;

    async fn get_status(&self, service_id: &str) -> StatusResult<ServiceStatus>;

    /// Ask the service to re-derive status from the cluster
    async fn check_status(&self, service_id: &str) -> StatusResult<()>;

    /// Suppress deletion handling for a resource while it is being replaced
    async fn ignore_delete(&self, resource_name: &str) -> StatusResult<()>;

    async fn rm_ignore_delete(&self, resource_name: &str) -> StatusResult<()>;
}
