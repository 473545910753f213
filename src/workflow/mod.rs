//! Multi-step workflows across capability providers.

pub mod engine;
pub mod gateway;
pub mod reference;
pub mod types;

pub use engine::WorkflowEngine;
pub use gateway::CapabilityGateway;
pub use reference::{resolve_input, ReferenceError};
pub use types::{RunStatus, StepFailure, StepOutcome, StepResult, WorkflowRun, WorkflowStep};
