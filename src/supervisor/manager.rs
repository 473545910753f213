//! Process supervisor: the provider table and per-provider lifecycle.
//!
//! Each registered provider gets a slot holding its launch spec, its state,
//! and (while live) its process handle and protocol session. Lifecycle
//! operations on one id are serialized through the slot's async lock;
//! different ids proceed in parallel. A background watcher per process marks
//! the slot `Crashed` when the process exits, or its session closes, while it
//! was expected to run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::errors::SupervisorError;
use super::lifecycle::{
    format_stderr_suffix, spawn_process, ExitInfo, ExitWatch, ProcessHandle, SpawnedProcess,
    StderrTail, STDERR_WAIT,
};
use super::types::{
    HealthSummary, LaunchSpec, ProbeReport, ProbeStatus, ProcessState, ServerProcess,
};
use crate::config::{millis, CoreConfig, SupervisorConfig};
use crate::errors::ErrorKind;
use crate::federation::ServerDescriptor;
use crate::protocol::ProtocolSession;
use crate::value::Value;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Providers checked at once by [`ProcessSupervisor::probe_all`].
const HEALTH_CHECK_CONCURRENCY: usize = 4;

/// After a session closes, how long to wait for the process to exit before
/// treating it as alive but unreachable.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

// ─── Slots ──────────────────────────────────────────────────────────────────

/// Mutable record for one provider id.
struct SlotState {
    spec: LaunchSpec,
    state: ProcessState,
    /// Incremented on every spawn; lets a stale exit watcher recognise itself.
    generation: u64,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    operation_count: usize,
    last_error: Option<String>,
    last_start: Option<Result<(), SupervisorError>>,
    session: Option<Arc<ProtocolSession>>,
    handle: Option<ProcessHandle>,
    stderr: Option<StderrTail>,
}

struct Slot {
    id: String,
    /// Held for the duration of every lifecycle operation on this id.
    lifecycle: tokio::sync::Mutex<()>,
    /// Completed start attempts.
    starts: AtomicU64,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(id: &str, spec: LaunchSpec) -> Self {
        Self {
            id: id.to_string(),
            lifecycle: tokio::sync::Mutex::new(()),
            starts: AtomicU64::new(0),
            state: Mutex::new(SlotState {
                spec,
                state: ProcessState::Stopped,
                generation: 0,
                pid: None,
                started_at: None,
                restart_count: 0,
                operation_count: 0,
                last_error: None,
                last_start: None,
                session: None,
                handle: None,
                stderr: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ServerProcess {
        let st = self.state();
        snapshot_of(&self.id, &st)
    }

    /// The bound session and its generation, if the provider is live and
    /// its session still open.
    fn live(&self) -> Option<(Arc<ProtocolSession>, u64)> {
        let st = self.state();
        if !st.state.is_live() {
            return None;
        }
        st.session
            .as_ref()
            .filter(|session| !session.is_closed())
            .map(|session| (Arc::clone(session), st.generation))
    }
}

/// Why a live provider stopped being reachable.
enum Lost {
    Exited(ExitInfo),
    OutputClosed,
}

fn snapshot_of(id: &str, st: &SlotState) -> ServerProcess {
    ServerProcess {
        id: id.to_string(),
        state: st.state,
        pid: st.pid,
        started_at: st.started_at,
        restart_count: st.restart_count,
        operation_count: st.operation_count,
        last_error: st.last_error.clone(),
    }
}

/// A provider that completed its handshake.
struct Launched {
    session: Arc<ProtocolSession>,
    handle: ProcessHandle,
    stderr: StderrTail,
    operation_count: usize,
}

// ─── ProcessSupervisor ──────────────────────────────────────────────────────

struct Inner {
    config: SupervisorConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Exit watchers keep slots alive; release the processes explicitly
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values() {
            let mut st = slot.state();
            st.session = None;
            st.handle = None;
        }
    }
}

/// Owns every supervised provider process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor with an empty provider table.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a supervisor and register every provider from the config.
    pub fn from_config(config: &CoreConfig) -> Self {
        let supervisor = Self::new(config.supervisor.clone());
        for (id, spec) in &config.providers {
            supervisor.register(id, spec.clone());
        }
        supervisor
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>, SupervisorError> {
        self.slots()
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProvider { id: id.to_string() })
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Register (or replace) the launch spec for `id`.
    ///
    /// A replaced spec takes effect on the next start.
    pub fn register(&self, id: &str, spec: LaunchSpec) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(id) {
            slot.state().spec = spec;
            tracing::debug!(server = %id, "launch spec replaced");
            return;
        }
        tracing::debug!(server = %id, command = %spec.command, "provider registered");
        slots.insert(id.to_string(), Arc::new(Slot::new(id, spec)));
    }

    /// Register a discovered provider under its canonical id.
    ///
    /// Returns `false` when the descriptor carries no launch spec.
    pub fn register_descriptor(&self, descriptor: &ServerDescriptor) -> bool {
        match &descriptor.launch_spec {
            Some(spec) => {
                self.register(&descriptor.canonical_id, spec.clone());
                true
            }
            None => false,
        }
    }

    pub fn registered(&self, id: &str) -> Option<LaunchSpec> {
        self.slots().get(id).map(|slot| slot.state().spec.clone())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Start `id` unless it is already live.
    ///
    /// A caller that queued behind another start receives that start's
    /// outcome instead of spawning again.
    pub async fn start(&self, id: &str) -> Result<ServerProcess, SupervisorError> {
        let slot = self.slot(id)?;
        let seen = slot.starts.load(Ordering::SeqCst);
        let _lifecycle = slot.lifecycle.lock().await;

        if slot.starts.load(Ordering::SeqCst) != seen {
            if let Some(Err(e)) = slot.state().last_start.clone() {
                return Err(e);
            }
        }
        if slot.live().is_some() {
            return Ok(slot.snapshot());
        }
        if slot.state().state.is_live() {
            // Live on paper but its session is gone; the watcher may not have run yet
            tracing::warn!(server = %slot.id, "session closed under a live provider, replacing it");
            self.stop_locked(&slot).await;
        }

        self.start_locked(&slot).await
    }

    /// Stop `id`: close its session, signal it, wait for the grace period,
    /// then force-kill. Ends in `Stopped`; stopping a stopped provider is a no-op.
    pub async fn stop(&self, id: &str) -> Result<ServerProcess, SupervisorError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lifecycle.lock().await;
        Ok(self.stop_locked(&slot).await)
    }

    /// Stop then start `id` without letting another lifecycle operation in between.
    pub async fn restart(&self, id: &str) -> Result<ServerProcess, SupervisorError> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lifecycle.lock().await;
        self.stop_locked(&slot).await;
        self.start_locked(&slot).await
    }

    /// Stop every provider.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let stops = slots.iter().map(|slot| async move {
            let _lifecycle = slot.lifecycle.lock().await;
            self.stop_locked(slot).await
        });
        let stopped = futures::future::join_all(stops).await;
        tracing::info!(providers = stopped.len(), "supervisor shut down");
    }

    async fn start_locked(&self, slot: &Arc<Slot>) -> Result<ServerProcess, SupervisorError> {
        let (spec, generation) = {
            let mut st = slot.state();
            st.generation += 1;
            if st.generation > 1 {
                st.restart_count += 1;
            }
            st.state = ProcessState::Starting;
            st.last_error = None;
            (st.spec.clone(), st.generation)
        };

        tracing::info!(server = %slot.id, command = %spec.command, "starting provider");
        let result = self.launch(slot, &spec, generation).await;
        slot.starts.fetch_add(1, Ordering::SeqCst);

        let mut st = slot.state();
        match result {
            Ok(launched) => {
                st.state = ProcessState::Running;
                st.pid = launched.handle.pid();
                st.started_at = Some(Utc::now());
                st.operation_count = launched.operation_count;
                st.session = Some(launched.session);
                st.handle = Some(launched.handle);
                st.stderr = Some(launched.stderr);
                st.last_start = Some(Ok(()));
                tracing::info!(
                    server = %slot.id,
                    pid = ?st.pid,
                    operations = st.operation_count,
                    "provider running"
                );
                Ok(snapshot_of(&slot.id, &st))
            }
            Err(e) => {
                tracing::warn!(
                    server = %slot.id,
                    phase = e.phase(),
                    error = %e,
                    "provider failed to start"
                );
                st.state = ProcessState::Crashed;
                st.pid = None;
                st.last_error = Some(e.to_string());
                st.last_start = Some(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Spawn, bind a session, and handshake. Kills the child on failure.
    async fn launch(
        &self,
        slot: &Arc<Slot>,
        spec: &LaunchSpec,
        generation: u64,
    ) -> Result<Launched, SupervisorError> {
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            handle,
        } = spawn_process(&slot.id, spec)?;

        let session = Arc::new(ProtocolSession::new(&slot.id, stdout, stdin));
        self.watch_process(slot, generation, handle.exit_watch(), session.closed());

        let timeout = self.inner.config.handshake_timeout();
        match session.handshake(timeout).await {
            Ok(summary) => Ok(Launched {
                session,
                handle,
                stderr,
                operation_count: summary.operations.len(),
            }),
            Err(e) => {
                session.close().await;
                handle.kill_and_wait().await;
                let captured = stderr.finish(STDERR_WAIT).await;
                if !captured.trim().is_empty() {
                    tracing::warn!(
                        server = %slot.id,
                        stderr = %captured.trim(),
                        "provider stderr captured on failure"
                    );
                }
                let id = slot.id.clone();
                let reason = format!("{e}{}", format_stderr_suffix(&captured));
                Err(match e.kind() {
                    ErrorKind::HandshakeTimeout => SupervisorError::HandshakeTimeout { id, reason },
                    _ => SupervisorError::HandshakeRejected { id, reason },
                })
            }
        }
    }

    /// Mark the slot `Crashed` if this generation exits, or its session
    /// closes, while live. A process left running without a session is killed.
    fn watch_process(
        &self,
        slot: &Arc<Slot>,
        generation: u64,
        mut exit: ExitWatch,
        closed: WaitForCancellationFutureOwned,
    ) {
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let exited = tokio::select! {
                info = exit.wait() => Some(info),
                () = closed => None,
            };
            let lost = match exited {
                Some(info) => Lost::Exited(info),
                // stdout EOF usually arrives just ahead of the exit status
                None => match tokio::time::timeout(EXIT_SETTLE, exit.wait()).await {
                    Ok(info) => Lost::Exited(info),
                    Err(_) => Lost::OutputClosed,
                },
            };

            let _lifecycle = slot.lifecycle.lock().await;
            let (session, handle) = {
                let mut st = slot.state();
                if st.generation != generation || !st.state.is_live() {
                    return;
                }
                let tail = st
                    .stderr
                    .take()
                    .map(|s| s.snapshot())
                    .unwrap_or_default();
                let reason = match &lost {
                    Lost::Exited(info) => format!("process exited unexpectedly ({info})"),
                    Lost::OutputClosed => "provider closed its output while still running".into(),
                };
                st.state = ProcessState::Crashed;
                st.pid = None;
                st.last_error = Some(format!("{reason}{}", format_stderr_suffix(&tail)));
                (st.session.take(), st.handle.take())
            };

            match &lost {
                Lost::Exited(info) => {
                    tracing::warn!(server = %slot.id, status = %info, "provider crashed");
                }
                Lost::OutputClosed => {
                    tracing::warn!(server = %slot.id, "provider session lost, killing process");
                }
            }
            if let Some(session) = session {
                session.close().await;
            }
            if let Some(handle) = handle {
                handle.kill_and_wait().await;
            }
        });
    }

    async fn stop_locked(&self, slot: &Arc<Slot>) -> ServerProcess {
        let (session, handle) = {
            let mut st = slot.state();
            let session = st.session.take();
            let handle = st.handle.take();
            st.stderr = None;
            if session.is_none() && handle.is_none() {
                st.state = ProcessState::Stopped;
                st.pid = None;
                return snapshot_of(&slot.id, &st);
            }
            st.state = ProcessState::Stopping;
            (session, handle)
        };

        tracing::info!(server = %slot.id, "stopping provider");

        // Closing the session closes stdin, which most providers treat as shutdown
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(handle) = handle {
            let info = handle.terminate(self.inner.config.stop_grace()).await;
            tracing::debug!(server = %slot.id, status = %info, "provider exited");
        }

        let mut st = slot.state();
        st.state = ProcessState::Stopped;
        st.pid = None;
        snapshot_of(&slot.id, &st)
    }

    // ─── Lookup ─────────────────────────────────────────────────────────

    pub fn process(&self, id: &str) -> Option<ServerProcess> {
        self.slots().get(id).map(|slot| slot.snapshot())
    }

    /// Snapshots of every registered provider, ordered by id.
    pub fn processes(&self) -> Vec<ServerProcess> {
        let mut all: Vec<ServerProcess> =
            self.slots().values().map(|slot| slot.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The live session for `id`. Never starts the provider.
    pub fn session(&self, id: &str) -> Result<Arc<ProtocolSession>, SupervisorError> {
        let slot = self.slot(id)?;
        match slot.live() {
            Some((session, _)) => Ok(session),
            None => Err(SupervisorError::NotRunning {
                id: id.to_string(),
                state: slot.state().state,
            }),
        }
    }

    /// The live session for `id`, starting the provider if needed.
    pub async fn ensure_running(&self, id: &str) -> Result<Arc<ProtocolSession>, SupervisorError> {
        let slot = self.slot(id)?;
        if let Some((session, _)) = slot.live() {
            return Ok(session);
        }
        self.start(id).await?;
        self.session(id)
    }

    /// Call `operation` on a running provider.
    ///
    /// Fails with a session-closed error when the provider is not live;
    /// use [`ProcessSupervisor::ensure_running`] to start it first.
    pub async fn call(
        &self,
        id: &str,
        operation: &str,
        input: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, SupervisorError> {
        let session = self.session(id)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.call_timeout());
        session
            .call(operation, input, timeout)
            .await
            .map_err(|e| SupervisorError::session(id, e))
    }

    // ─── Health ─────────────────────────────────────────────────────────

    /// Start `id` if needed and re-enumerate its operations.
    ///
    /// A failed health check demotes `Running` to `Degraded`; a successful one
    /// promotes `Degraded` back to `Running`.
    pub async fn probe(&self, id: &str) -> ProbeReport {
        let started = Instant::now();
        let report = |status, operation_count, error: Option<String>| ProbeReport {
            id: id.to_string(),
            status,
            latency_ms: millis(started.elapsed()),
            operation_count,
            error,
        };

        if let Err(e) = self.ensure_running(id).await {
            return report(ProbeStatus::Unavailable, 0, Some(e.to_string()));
        }
        let Ok(slot) = self.slot(id) else {
            let message = format!("no provider registered as '{id}'");
            return report(ProbeStatus::Unavailable, 0, Some(message));
        };
        let Some((session, generation)) = slot.live() else {
            return report(
                ProbeStatus::Unavailable,
                0,
                Some("provider is not running".into()),
            );
        };

        let result = session
            .list_operations(self.inner.config.call_timeout())
            .await;

        let _lifecycle = slot.lifecycle.lock().await;
        let mut st = slot.state();
        let current = st.generation == generation;
        match result {
            Ok(operations) => {
                if current {
                    st.operation_count = operations.len();
                    if st.state == ProcessState::Degraded {
                        st.state = ProcessState::Running;
                        st.last_error = None;
                        tracing::info!(server = %id, "provider recovered");
                    }
                }
                report(ProbeStatus::Healthy, operations.len(), None)
            }
            Err(e) => {
                if current {
                    if st.state == ProcessState::Running {
                        st.state = ProcessState::Degraded;
                        tracing::warn!(
                            server = %id,
                            error = %e,
                            "health check failed, provider degraded"
                        );
                    }
                    st.last_error = Some(e.to_string());
                }
                let status = if st.state.is_live() {
                    ProbeStatus::Degraded
                } else {
                    ProbeStatus::Unavailable
                };
                report(status, st.operation_count, Some(e.to_string()))
            }
        }
    }

    /// Health-check every registered provider with bounded concurrency.
    pub async fn probe_all(&self) -> HealthSummary {
        let ids: Vec<String> = self.slots().keys().cloned().collect();
        let reports: Vec<ProbeReport> = stream::iter(ids)
            .map(|id| async move { self.probe(&id).await })
            .buffer_unordered(HEALTH_CHECK_CONCURRENCY)
            .collect()
            .await;

        let summary = HealthSummary::from_reports(reports);
        tracing::info!(
            total = summary.total,
            healthy = summary.healthy,
            degraded = summary.degraded,
            unavailable = summary.unavailable,
            "health check complete"
        );
        summary
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("providers", &self.slots().len())
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
