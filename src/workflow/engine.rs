//! Sequential execution of workflow plans.
//!
//! Steps run strictly in order. Each step's input is resolved against the
//! output of the step immediately before it, then sent to the provider
//! through the [`CapabilityGateway`]. Nothing is retried. Failures never
//! escape `run`: they end up in the step records and the run status.

use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::gateway::CapabilityGateway;
use super::reference::resolve_input;
use super::types::{RunStatus, StepFailure, StepOutcome, StepResult, WorkflowRun, WorkflowStep};
use crate::config::millis;
use crate::errors::ErrorKind;
use crate::value::Value;

pub struct WorkflowEngine<G> {
    gateway: G,
}

impl<G: CapabilityGateway> WorkflowEngine<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub async fn run(&self, name: &str, steps: Vec<WorkflowStep>) -> WorkflowRun {
        self.execute(WorkflowRun::new(name, steps), &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        name: &str,
        steps: Vec<WorkflowStep>,
        cancel: &CancellationToken,
    ) -> WorkflowRun {
        self.execute(WorkflowRun::new(name, steps), cancel).await
    }

    /// Drive a pending run to a terminal status.
    ///
    /// A run that is not `Pending` is returned unchanged.
    pub async fn execute(&self, mut run: WorkflowRun, cancel: &CancellationToken) -> WorkflowRun {
        if run.status != RunStatus::Pending {
            tracing::warn!(run = %run.id, status = ?run.status, "workflow run already started");
            return run;
        }

        let started = Instant::now();
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        tracing::info!(
            run = %run.id,
            name = %run.name,
            steps = run.steps.len(),
            "workflow started"
        );

        let steps = run.steps.clone();
        let mut previous: Option<Value> = None;
        let mut halt: Option<(usize, StepFailure)> = None;

        for (index, step) in steps.iter().enumerate() {
            let result = self.execute_step(index, step, previous.as_ref(), cancel)
                .await;

            match &result.outcome {
                StepOutcome::Succeeded { output } => {
                    tracing::info!(
                        run = %run.id,
                        step = index,
                        target = %step.label(),
                        latency_ms = result.latency_ms,
                        "workflow step succeeded"
                    );
                    previous = Some(output.clone());
                }
                StepOutcome::Failed { failure } => {
                    tracing::warn!(
                        run = %run.id,
                        step = index,
                        target = %step.label(),
                        kind = %failure.kind,
                        optional = step.optional,
                        error = %failure.message,
                        "workflow step failed"
                    );
                    previous = None;
                    let cancelled = failure.kind == ErrorKind::Cancelled;
                    if !step.optional || cancelled {
                        halt = Some((index, failure.clone()));
                    }
                }
            }

            run.step_results.push(result);
            if halt.is_some() {
                break;
            }
        }

        run.status = match &halt {
            None => RunStatus::Succeeded,
            Some((_, failure)) if failure.kind == ErrorKind::Cancelled => RunStatus::Failed,
            Some(_) if run.succeeded_steps() > 0 => RunStatus::PartiallyFailed,
            Some(_) => RunStatus::Failed,
        };
        run.failure_reason = halt.map(|(index, failure)| {
            let step = &steps[index];
            format!("step {index} ({}) failed: {failure}", step.label())
        });
        run.finished_at = Some(Utc::now());
        run.duration_ms = Some(millis(started.elapsed()));

        tracing::info!(
            run = %run.id,
            name = %run.name,
            status = ?run.status,
            succeeded = run.succeeded_steps(),
            attempted = run.step_results.len(),
            duration_ms = run.duration_ms,
            "workflow finished"
        );
        run
    }

    async fn execute_step(
        &self,
        index: usize,
        step: &WorkflowStep,
        previous: Option<&Value>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();
        let record = |resolved_input: Option<Value>, outcome: StepOutcome| StepResult {
            index,
            provider: step.provider.clone(),
            operation: step.operation.clone(),
            resolved_input,
            outcome,
            latency_ms: millis(started.elapsed()),
        };

        if cancel.is_cancelled() {
            return record(
                None,
                StepOutcome::Failed {
                    failure: StepFailure::cancelled(&step.provider),
                },
            );
        }

        // Resolution failures never reach the provider
        let input = match resolve_input(&step.input, previous) {
            Ok(input) => input,
            Err(e) => {
                return record(
                    None,
                    StepOutcome::Failed {
                        failure: StepFailure::reference(&step.provider, &e),
                    },
                )
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepFailure::cancelled(&step.provider)),
            result = self.gateway.invoke(
                &step.provider,
                &step.operation,
                &input,
                step.timeout(),
            ) => result,
        };

        let outcome = match outcome {
            Ok(output) => StepOutcome::Succeeded { output },
            Err(failure) => StepOutcome::Failed { failure },
        };
        record(Some(input), outcome)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Handler = Box<dyn Fn(&Value) -> Result<Value, StepFailure> + Send + Sync>;

    /// Records every invocation and answers from a table keyed by operation.
    #[derive(Default)]
    struct FakeGateway {
        handlers: HashMap<String, Handler>,
        calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl FakeGateway {
        fn on(
            mut self,
            operation: &str,
            handler: impl Fn(&Value) -> Result<Value, StepFailure> + Send + Sync + 'static,
        ) -> Self {
            let handler: Handler = Box::new(handler);
            self.handlers.insert(operation.to_string(), handler);
            self
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CapabilityGateway for FakeGateway {
        async fn invoke(
            &self,
            provider: &str,
            operation: &str,
            input: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, StepFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((provider.to_string(), operation.to_string(), input.clone()));
            if operation == "hang" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            match self.handlers.get(operation) {
                Some(handler) => handler(input),
                None => Err(StepFailure {
                    kind: ErrorKind::UnknownOperation,
                    provider: provider.to_string(),
                    phase: "call".into(),
                    message: format!("no operation '{operation}'"),
                }),
            }
        }
    }

    fn provider_error(message: &str) -> StepFailure {
        StepFailure {
            kind: ErrorKind::ProviderReportedError,
            provider: "p".into(),
            phase: "call".into(),
            message: message.into(),
        }
    }

    fn search_gateway() -> FakeGateway {
        FakeGateway::default()
            .on("search", |_| {
                Ok(Value::from(json!({
                    "results": [{"url": "a"}, {"url": "b"}, {"url": "c"}, {"url": "d"}]
                })))
            })
            .on("fetch", |input| Ok(input.clone()))
            .on("fail", |_| Err(provider_error("boom")))
    }

    fn step(operation: &str, input: serde_json::Value) -> WorkflowStep {
        WorkflowStep::new("p", operation, Value::from(input))
    }

    #[tokio::test]
    async fn test_references_flow_between_steps() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine
            .run(
                "research",
                vec![
                    step("search", json!({"q": "rust"})),
                    step("fetch", json!({"urls": "$previous.results[0:3].url"})),
                ],
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.failure_reason.is_none());
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(
            run.final_output(),
            Some(&Value::from(json!({"urls": ["a", "b", "c"]})))
        );
        assert!(run.started_at.is_some() && run.finished_at.is_some());
        assert!(run.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_missing_reference_never_contacts_provider() {
        let gateway = Arc::new(search_gateway());
        let engine = WorkflowEngine::new(Arc::clone(&gateway));
        let run = engine
            .run(
                "broken",
                vec![
                    step("search", json!({})),
                    step("fetch", json!({"urls": "$previous.items[0]"})),
                ],
            )
            .await;

        assert_eq!(run.status, RunStatus::PartiallyFailed);
        let failure = run.step_results[1].failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::ReferenceResolutionError);
        assert_eq!(failure.phase, "reference");
        assert!(run.step_results[1].resolved_input.is_none());

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "search");
    }

    #[tokio::test]
    async fn test_failure_preserves_completed_results() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine
            .run(
                "three",
                vec![
                    step("search", json!({})),
                    step("fail", json!({})),
                    step("fetch", json!({})),
                ],
            )
            .await;

        assert_eq!(run.status, RunStatus::PartiallyFailed);
        assert_eq!(run.step_results.len(), 2);
        assert!(run.step_results[0].succeeded());
        assert_eq!(
            run.step_results[1].failure().unwrap().kind,
            ErrorKind::ProviderReportedError
        );
        let reason = run.failure_reason.unwrap();
        assert!(reason.starts_with("step 1 (p/fail)"), "{reason}");
    }

    #[tokio::test]
    async fn test_first_step_failure_is_failed() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine
            .run(
                "nope",
                vec![step("fail", json!({})), step("search", json!({}))],
            )
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step_results.len(), 1);
    }

    #[tokio::test]
    async fn test_optional_failure_continues() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine
            .run(
                "optional",
                vec![
                    step("search", json!({})),
                    step("fail", json!({})).optional(),
                    step("fetch", json!({"static": true})),
                ],
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.step_results.len(), 3);
        assert!(!run.step_results[1].succeeded());
        assert_eq!(run.succeeded_steps(), 2);
    }

    #[tokio::test]
    async fn test_reference_after_optional_failure_has_no_previous() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine
            .run(
                "gap",
                vec![
                    step("search", json!({})),
                    step("fail", json!({})).optional(),
                    step("fetch", json!({"u": "$previous.results"})),
                ],
            )
            .await;

        assert_eq!(run.status, RunStatus::PartiallyFailed);
        assert_eq!(
            run.step_results[2].failure().unwrap().kind,
            ErrorKind::ReferenceResolutionError
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_step() {
        let engine = WorkflowEngine::new(search_gateway());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let run = engine
            .run_with_cancel(
                "cancelled",
                vec![
                    step("search", json!({})),
                    step("hang", json!({})),
                    step("fetch", json!({})),
                ],
                &cancel,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step_results.len(), 2);
        assert!(run.step_results[0].succeeded());
        assert_eq!(
            run.step_results[1].failure().unwrap().kind,
            ErrorKind::Cancelled
        );
        assert!(run.failure_reason.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let gateway = Arc::new(search_gateway());
        let engine = WorkflowEngine::new(Arc::clone(&gateway));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = engine
            .run_with_cancel("early", vec![step("search", json!({}))], &cancel)
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_rerun() {
        let engine = WorkflowEngine::new(search_gateway());
        let run = engine.run("once", vec![step("search", json!({}))]).await;
        let again = engine.execute(run.clone(), &CancellationToken::new()).await;
        assert_eq!(again, run);
    }
}
