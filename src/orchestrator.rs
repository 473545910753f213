//! The assembled core: discovery, supervision and workflows behind one handle.

use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::federation::{RegistryFederator, SearchOutcome};
use crate::supervisor::ProcessSupervisor;
use crate::workflow::{WorkflowEngine, WorkflowRun, WorkflowStep};

/// Owns one federator, one supervisor and a workflow engine driving that
/// supervisor. Nothing here is global; dropping the core stops nothing, so
/// call [`CapabilityCore::shutdown`] first.
pub struct CapabilityCore {
    federator: RegistryFederator,
    supervisor: ProcessSupervisor,
    engine: WorkflowEngine<ProcessSupervisor>,
}

impl CapabilityCore {
    pub fn from_config(config: &CoreConfig) -> Self {
        let federator = RegistryFederator::from_config(&config.federation);
        let supervisor = ProcessSupervisor::from_config(config);
        tracing::info!(
            sources = config.federation.sources.len(),
            providers = config.providers.len(),
            "capability core ready"
        );
        Self::new(federator, supervisor)
    }

    pub fn new(federator: RegistryFederator, supervisor: ProcessSupervisor) -> Self {
        Self {
            federator,
            engine: WorkflowEngine::new(supervisor.clone()),
            supervisor,
        }
    }

    pub fn federator(&self) -> &RegistryFederator {
        &self.federator
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Federated search. Descriptors carrying a launch spec are registered
    /// with the supervisor unless their id is already known, so configured
    /// providers keep their configured spec.
    pub async fn search(&self, query: &str) -> SearchOutcome {
        let outcome = self.federator.search(query).await;
        let mut registered = 0;
        for descriptor in &outcome.descriptors {
            if self.supervisor.registered(&descriptor.canonical_id).is_none()
                && self.supervisor.register_descriptor(descriptor)
            {
                registered += 1;
            }
        }
        if registered > 0 {
            tracing::debug!(registered, "registered discovered providers");
        }
        outcome
    }

    pub async fn run(&self, name: &str, steps: Vec<WorkflowStep>) -> WorkflowRun {
        self.engine.run(name, steps).await
    }

    pub async fn run_with_cancel(
        &self,
        name: &str,
        steps: Vec<WorkflowStep>,
        cancel: &CancellationToken,
    ) -> WorkflowRun {
        self.engine.run_with_cancel(name, steps, cancel).await
    }

    /// Stop every supervised provider.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::{ProvenanceTag, RegistryEntry, StaticSource};
    use crate::supervisor::LaunchSpec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_search_registers_launchable_descriptors() {
        let config: CoreConfig = serde_yaml::from_str(
            r#"
providers:
  fetch:
    command: configured-fetch
"#,
        )
        .unwrap();
        let pinned = StaticSource::new(
            "pinned",
            ProvenanceTag::CuratedList,
            vec![
                RegistryEntry {
                    launch: Some(LaunchSpec::new("discovered-fetch")),
                    ..RegistryEntry::named("mcp-server-fetch")
                },
                RegistryEntry {
                    launch: Some(LaunchSpec::new("uvx").with_args(["mcp-server-time"])),
                    ..RegistryEntry::named("time")
                },
                RegistryEntry::named("no-launch"),
            ],
        );
        let federator = RegistryFederator::new(Duration::from_secs(1), Duration::from_secs(1))
            .with_source(pinned);
        let core = CapabilityCore::new(federator, ProcessSupervisor::from_config(&config));

        let outcome = core.search("").await;
        assert_eq!(outcome.descriptors.len(), 3);
        assert_eq!(
            core.supervisor().registered("fetch").unwrap().command,
            "configured-fetch"
        );
        assert_eq!(core.supervisor().registered("time").unwrap().command, "uvx");
        assert!(core.supervisor().registered("no-launch").is_none());
    }

    #[tokio::test]
    async fn test_run_against_unknown_provider_fails_cleanly() {
        let core = CapabilityCore::from_config(&CoreConfig::default());
        let run = core
            .run(
                "nothing",
                vec![WorkflowStep::new("ghost", "op", Default::default())],
            )
            .await;
        assert_eq!(run.status, crate::workflow::RunStatus::Failed);
        let failure = run.step_results[0].failure().unwrap();
        assert_eq!(failure.kind, crate::errors::ErrorKind::UnknownProvider);
        assert_eq!(failure.phase, "lookup");
        core.shutdown().await;
    }
}
