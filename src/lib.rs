//! capstack: discovery, supervision and orchestration of capability providers.
//!
//! - [`federation`] searches several registries at once and merges what they
//!   report into deduplicated, trust-scored descriptors.
//! - [`supervisor`] runs providers as child processes and keeps one protocol
//!   session per live provider.
//! - [`protocol`] speaks newline-delimited JSON-RPC 2.0 over a child's stdio.
//! - [`workflow`] executes ordered multi-step plans across providers.
//!
//! [`CapabilityCore`] wires the three runtime parts together from a
//! [`config::CoreConfig`].

pub mod config;
pub mod errors;
pub mod federation;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod supervisor;
pub mod value;
pub mod workflow;

pub use config::CoreConfig;
pub use errors::ErrorKind;
pub use federation::{RegistryFederator, SearchOutcome, ServerDescriptor};
pub use orchestrator::CapabilityCore;
pub use protocol::ProtocolSession;
pub use supervisor::{ProcessState, ProcessSupervisor, ServerProcess};
pub use value::Value;
pub use workflow::{CapabilityGateway, RunStatus, WorkflowEngine, WorkflowRun, WorkflowStep};
