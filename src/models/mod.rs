//! # Models
//!
//! Tasks decoded from the queue, the desired state of tenant services and
//! the workload bookkeeping records.

pub mod service;
pub mod task;
pub mod workload;

pub use service::{
    ContainerPort, ProbeAction, ProbeSpec, ResourceLimits, ServiceDesiredState, VolumeSource,
    VolumeSpec, WorkloadKind,
};
pub use task::{
    HorizontalScalingTaskBody, RestartTaskBody, RollbackTaskBody, RollingUpgradeTaskBody,
    StartTaskBody, StopTaskBody, Task, TaskBody, TaskKind, VerticalScalingTaskBody, WorkerKey,
};
pub use workload::{PodRecord, ResourceKind, ScaleMode, ScalingIntent, WorkloadRecord};
