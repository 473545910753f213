//! Workflows driven through the supervisor against the echo provider.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use capstack::config::CoreConfig;
use capstack::errors::ErrorKind;
use capstack::supervisor::ProcessState;
use capstack::value::Value;
use capstack::workflow::{RunStatus, WorkflowStep};
use capstack::CapabilityCore;

fn core() -> CapabilityCore {
    let binary = env!("CARGO_BIN_EXE_capstack-echo-provider");
    let yaml = format!(
        r#"
supervisor:
  handshake_timeout_ms: 10000
  call_timeout_ms: 5000
  stop_grace_ms: 2000
providers:
  search:
    command: "{binary}"
  reader:
    command: "{binary}"
"#
    );
    let config: CoreConfig = serde_yaml::from_str(&yaml).unwrap();
    CapabilityCore::from_config(&config)
}

fn step(provider: &str, operation: &str, input: serde_json::Value) -> WorkflowStep {
    WorkflowStep::new(provider, operation, Value::from(input))
}

#[tokio::test]
async fn test_search_then_fetch_with_reference() {
    let core = core();
    let run = core
        .run(
            "research",
            vec![
                step("search", "search", json!({"q": "rust", "count": 5})),
                step(
                    "reader",
                    "echo",
                    json!({"urls": "$previous.results[0:3].url"}),
                ),
            ],
        )
        .await;

    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.failure_reason);
    assert_eq!(run.step_results.len(), 2);
    assert_eq!(
        run.final_output(),
        Some(&Value::from(json!({"urls": ["a", "b", "c"]})))
    );
    assert!(run.step_results.iter().all(|r| r.succeeded()));

    // Both providers were started on demand
    assert_eq!(
        core.supervisor().process("search").unwrap().state,
        ProcessState::Running
    );
    assert_eq!(
        core.supervisor().process("reader").unwrap().state,
        ProcessState::Running
    );
    core.shutdown().await;
}

#[tokio::test]
async fn test_missing_reference_does_not_start_provider() {
    let core = core();
    let run = core
        .run(
            "broken",
            vec![
                step("search", "search", json!({})),
                step("reader", "echo", json!({"urls": "$previous.items[0].url"})),
            ],
        )
        .await;

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    let failure = run.step_results[1].failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::ReferenceResolutionError);
    assert_eq!(
        core.supervisor().process("reader").unwrap().state,
        ProcessState::Stopped
    );
    core.shutdown().await;
}

#[tokio::test]
async fn test_middle_failure_keeps_prior_results() {
    let core = core();
    let run = core
        .run(
            "three",
            vec![
                step("search", "search", json!({})),
                step("search", "fail", json!({})),
                step("reader", "echo", json!({})),
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
    assert!(run.failure_reason.is_some());
    core.shutdown().await;
}

#[tokio::test]
async fn test_step_timeout() {
    let core = core();
    let run = core
        .run(
            "slow",
            vec![
                step("search", "sleep", json!({"ms": 2_000}))
                    .with_timeout(Duration::from_millis(100)),
            ],
        )
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.step_results[0].failure().unwrap().kind,
        ErrorKind::CallTimeout
    );
    core.shutdown().await;
}

#[tokio::test]
async fn test_cancel_in_flight_step() {
    let core = core();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        trigger.cancel();
    });

    let run = core
        .run_with_cancel(
            "cancelled",
            vec![
                step("search", "search", json!({})),
                step("search", "sleep", json!({"ms": 30_000})),
            ],
            &cancel,
        )
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_results.len(), 2);
    assert!(run.step_results[0].succeeded());
    assert_eq!(
        run.step_results[1].failure().unwrap().kind,
        ErrorKind::Cancelled
    );

    // The abandoned call does not leak a pending slot
    let session = core.supervisor().session("search").unwrap();
    assert_eq!(session.pending_count(), 0);
    core.shutdown().await;
}
