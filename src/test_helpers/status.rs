//! In-memory status sync client

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::constants::ServiceStatus;
use crate::status::{StatusResult, StatusSyncClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCall {
    Set(String, ServiceStatus),
    Get(String),
    Check(String),
    IgnoreDelete(String),
    RmIgnoreDelete(String),
}

#[derive(Default)]
struct StatusState {
    statuses: HashMap<String, ServiceStatus>,
    ignored: HashSet<String>,
    calls: Vec<StatusCall>,
}

/// Status client recording every call; unknown services report `Unknown`
#[derive(Default)]
pub struct MemoryStatusClient {
    state: Mutex<StatusState>,
}

impl MemoryStatusClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(&self, service_id: &str, status: ServiceStatus) {
        self.state
            .lock()
            .statuses
            .insert(service_id.to_string(), status);
    }

    pub fn current(&self, service_id: &str) -> Option<ServiceStatus> {
        self.state.lock().statuses.get(service_id).copied()
    }

    pub fn calls(&self) -> Vec<StatusCall> {
        self.state.lock().calls.clone()
    }

    /// Statuses published for a service, in order
    pub fn published(&self, service_id: &str) -> Vec<ServiceStatus> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StatusCall::Set(id, status) if id == service_id => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn is_ignoring(&self, resource_name: &str) -> bool {
        self.state.lock().ignored.contains(resource_name)
    }
}

#[async_trait]
impl StatusSyncClient for MemoryStatusClient {
    async fn set_status(&self, service_id: &str, status: ServiceStatus) -> StatusResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(StatusCall::Set(service_id.to_string(), status));
        state.statuses.insert(service_id.to_string(), status);
        Ok(())
    }

    async fn get_status(&self, service_id: &str) -> StatusResult<ServiceStatus> {
        let mut state = self.state.lock();
        state.calls.push(StatusCall::Get(service_id.to_string()));
        Ok(state
            .statuses
            .get(service_id)
            .copied()
            .unwrap_or(ServiceStatus::Unknown))
    }

    async fn check_status(&self, service_id: &str) -> StatusResult<()> {
        self.state
            .lock()
            .calls
            .push(StatusCall::Check(service_id.to_string()));
        Ok(())
    }

    async fn ignore_delete(&self, resource_name: &str) -> StatusResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(StatusCall::IgnoreDelete(resource_name.to_string()));
        state.ignored.insert(resource_name.to_string());
        Ok(())
    }

    async fn rm_ignore_delete(&self, resource_name: &str) -> StatusResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(StatusCall::RmIgnoreDelete(resource_name.to_string()));
        state.ignored.remove(resource_name);
        Ok(())
    }
}
