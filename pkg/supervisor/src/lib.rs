//! Workload process supervision: spawn, registry, log streaming, event
//! extraction, resource sampling, graceful/forced stop.

pub mod events;
pub mod logs;
pub mod registry;
pub mod supervisor;
pub mod usage;

pub use events::{LogEvent, ParticipantRoster};
pub use logs::LogHub;
pub use registry::{ManagedProcess, ProcessRegistry};
pub use supervisor::{
    LaunchSpec, Supervisor, SupervisorConfig, WorkloadNotification, build_library_path,
};
pub use usage::{UsageHub, UsageSample};
