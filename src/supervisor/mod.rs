//! Process supervision for capability providers.
//!
//! Spawns providers as child processes, binds a protocol session to each,
//! watches for unexpected exits, and terminates them gracefully.

pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod types;

pub use errors::SupervisorError;
pub use manager::ProcessSupervisor;
pub use types::{HealthSummary, LaunchSpec, ProbeReport, ProbeStatus, ProcessState, ServerProcess};
