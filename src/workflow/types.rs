//! Workflow plans, runs and per-step records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::millis;
use crate::errors::ErrorKind;
use crate::supervisor::SupervisorError;
use crate::value::Value;

use super::reference::ReferenceError;

// ─── Plan ───────────────────────────────────────────────────────────────────

/// One call in a workflow plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub provider: String,
    pub operation: String,
    /// May contain `$previous...` references to the prior step's output.
    #[serde(default)]
    pub input: Value,
    /// A failed optional step is recorded and the run continues.
    #[serde(default)]
    pub optional: bool,
    /// Falls back to the gateway's call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>, input: Value) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            input,
            optional: false,
            timeout_ms: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(millis(timeout));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn label(&self) -> String {
        format!("{}/{}", self.provider, self.operation)
    }
}

// ─── Step Records ───────────────────────────────────────────────────────────

/// Why a step did not produce output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub provider: String,
    /// Where it failed: `reference`, `lookup`, `spawn`, `handshake`, `call`
    /// or `cancelled`.
    pub phase: String,
    pub message: String,
}

impl StepFailure {
    pub fn from_supervisor(err: &SupervisorError) -> Self {
        Self {
            kind: err.kind(),
            provider: err.id().to_string(),
            phase: err.phase().to_string(),
            message: err.to_string(),
        }
    }

    pub fn reference(provider: &str, err: &ReferenceError) -> Self {
        Self {
            kind: err.kind(),
            provider: provider.to_string(),
            phase: "reference".into(),
            message: err.to_string(),
        }
    }

    pub fn cancelled(provider: &str) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            provider: provider.to_string(),
            phase: "cancelled".into(),
            message: "workflow cancelled".into(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { output: Value },
    Failed { failure: StepFailure },
}

/// What happened to one attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub provider: String,
    pub operation: String,
    /// The input after reference resolution, when resolution succeeded.
    pub resolved_input: Option<Value>,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub latency_ms: u64,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            StepOutcome::Succeeded { output } => Some(output),
            StepOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.outcome {
            StepOutcome::Succeeded { .. } => None,
            StepOutcome::Failed { failure } => Some(failure),
        }
    }
}

// ─── Runs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::PartiallyFailed
        )
    }
}

/// One execution of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// One entry per attempted step, in order.
    pub step_results: Vec<StepResult>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

impl WorkflowRun {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps,
            step_results: Vec::new(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            failure_reason: None,
        }
    }

    pub fn succeeded_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.succeeded()).count()
    }

    /// Output of the last successful step.
    pub fn final_output(&self) -> Option<&Value> {
        self.step_results.iter().rev().find_map(StepResult::output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_deserializes_with_defaults() {
        let step: WorkflowStep =
            serde_json::from_str(r#"{"provider": "search", "operation": "query"}"#).unwrap();
        assert_eq!(step.input, Value::Null);
        assert!(!step.optional);
        assert!(step.timeout().is_none());

        let step = step.with_timeout(Duration::from_millis(1500)).optional();
        assert_eq!(step.timeout_ms, Some(1500));
        assert!(step.optional);
    }

    #[test]
    fn test_step_result_serializes_flat() {
        let result = StepResult {
            index: 0,
            provider: "p".into(),
            operation: "op".into(),
            resolved_input: None,
            outcome: StepOutcome::Failed {
                failure: StepFailure::cancelled("p"),
            },
            latency_ms: 3,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure"]["kind"], "cancelled");
        assert!(!result.succeeded());
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = WorkflowRun::new("empty", Vec::new());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.status.is_terminal());
        assert!(run.final_output().is_none());
    }
}
