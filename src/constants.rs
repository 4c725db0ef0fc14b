//! # System Constants
//!
//! Service status values shared with the status sync service, label keys
//! stamped on every generated resource and default timing constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label keys stamped on workloads, pods and services
pub mod labels {
    /// Service alias, used by pod watches and service selectors
    pub const NAME: &str = "name";
    /// Deploy version of the running build
    pub const VERSION: &str = "version";
    /// Owning workload resource, keeps two generations of one service apart
    pub const WORKLOAD: &str = "workload";
    pub const SERVICE_ID: &str = "service_id";
    pub const TENANT_ID: &str = "tenant_id";
    pub const CREATOR: &str = "creator";
    pub const CREATOR_VALUE: &str = "workload-worker";

    /// Service type label values stored alongside a service definition
    pub const STATEFUL_SERVICE_TYPE: &str = "StatefulServiceType";
    pub const STATELESS_SERVICE_TYPE: &str = "StatelessServiceType";
}

/// Default timing constants
pub mod timing {
    /// Base seconds granted to a scale-up wait per added replica
    pub const SCALE_UP_BASE_SECS: u64 = 60;
    /// Seconds granted to a scale-down wait per removed replica
    pub const SCALE_DOWN_PER_POD_SECS: u64 = 40;
    /// Pause between rolling replacement steps
    pub const ROLLOUT_STEP_INTERVAL_MS: u64 = 1000;
    /// Consecutive scheduling failures before a pod is reported as unschedulable
    pub const SCHEDULING_FAILURE_THRESHOLD: u32 = 3;
    pub const DEQUEUE_DEADLINE_SECS: u64 = 5;
    pub const DEQUEUE_ERROR_BACKOFF_SECS: u64 = 2;
    pub const RETRY_BACKOFF_SECS: u64 = 3;
}

/// Service status as known to the status sync service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Closed,
    Upgrade,
    Abnormal,
    Undeploy,
    Unknown,
}

impl ServiceStatus {
    /// Whether the service counts as not running
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Undeploy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
            Self::Upgrade => "upgrade",
            Self::Abnormal => "abnormal",
            Self::Undeploy => "undeploy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "closed" => Ok(Self::Closed),
            "upgrade" => Ok(Self::Upgrade),
            "abnormal" => Ok(Self::Abnormal),
            "undeploy" => Ok(Self::Undeploy),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("Invalid service status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_statuses() {
        assert!(ServiceStatus::Closed.is_closed());
        assert!(ServiceStatus::Undeploy.is_closed());
        assert!(!ServiceStatus::Running.is_closed());
        assert!(!ServiceStatus::Abnormal.is_closed());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ServiceStatus::Starting,
            ServiceStatus::Running,
            ServiceStatus::Upgrade,
        ] {
            assert_eq!(status.as_str().parse::<ServiceStatus>(), Ok(status));
        }
        assert!("bogus".parse::<ServiceStatus>().is_err());
    }
}
