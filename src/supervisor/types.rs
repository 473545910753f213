//! Supervisor data types: launch specs, process snapshots, health reports.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Launch Spec ────────────────────────────────────────────────────────────

/// How to start a capability provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment values passed through to the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variables the provider needs. Missing ones are warned about at spawn time.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Required variables set neither in `env` nor in the parent environment.
    pub fn missing_env(&self) -> Vec<&str> {
        self.required_env
            .iter()
            .filter(|name| !self.env.contains_key(*name) && std::env::var_os(name).is_none())
            .map(String::as_str)
            .collect()
    }
}

// ─── Process State ──────────────────────────────────────────────────────────

/// Lifecycle state of a supervised provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Crashed,
    Stopping,
}

impl ProcessState {
    /// States in which a session is bound and calls may be made.
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Degraded => "degraded",
            ProcessState::Crashed => "crashed",
            ProcessState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a supervised provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerProcess {
    pub id: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    /// Operations enumerated during the most recent handshake or health check.
    pub operation_count: usize,
    pub last_error: Option<String>,
}

// ─── Health ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// The provider answered an enumeration request.
    Healthy,
    /// The provider is running but did not answer the health check.
    Degraded,
    /// The provider could not be started.
    Unavailable,
}

/// Result of probing one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub id: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub operation_count: usize,
    pub error: Option<String>,
}

/// Result of probing every registered provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unavailable: usize,
    pub reports: Vec<ProbeReport>,
}

impl HealthSummary {
    pub fn from_reports(mut reports: Vec<ProbeReport>) -> Self {
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        let count = |status| reports.iter().filter(|r| r.status == status).count();
        Self {
            total: reports.len(),
            healthy: count(ProbeStatus::Healthy),
            degraded: count(ProbeStatus::Degraded),
            unavailable: count(ProbeStatus::Unavailable),
            reports,
        }
    }
}
