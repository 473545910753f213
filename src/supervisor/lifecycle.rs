//! OS-level process handling for capability providers.
//!
//! Spawns a provider with piped stdio, hands the child to a watcher task
//! that owns it until exit, and exposes:
//! - a [`ProcessHandle`] to terminate it (SIGTERM, grace period, kill)
//! - an [`ExitWatch`] to observe its exit
//! - a [`StderrTail`] that keeps the last part of its stderr for diagnostics

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::SupervisorError;
use super::types::LaunchSpec;
use crate::config::millis;
use crate::protocol::{BoxedReader, BoxedWriter};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Characters of stderr retained per provider.
const STDERR_TAIL_CHARS: usize = 2000;

/// How long to wait for stderr to drain after a failed start.
pub const STDERR_WAIT: Duration = Duration::from_millis(500);

/// How long to wait for the OS to reap a force-killed process.
const KILL_WAIT: Duration = Duration::from_secs(5);

// ─── Exit Observation ───────────────────────────────────────────────────────

/// How a provider process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    fn unknown() -> Self {
        Self {
            code: None,
            description: "exit status unavailable".into(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Resolves once the process has exited. Cheap to clone.
#[derive(Clone)]
pub struct ExitWatch(watch::Receiver<Option<ExitInfo>>);

impl ExitWatch {
    pub async fn wait(&mut self) -> ExitInfo {
        match self.0.wait_for(Option::is_some).await {
            Ok(info) => (*info).clone().unwrap_or_else(ExitInfo::unknown),
            // The watcher task is gone, so the child is too
            Err(_) => ExitInfo::unknown(),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.0.borrow().is_some()
    }
}

// ─── Process Handle ─────────────────────────────────────────────────────────

/// Control handle for a spawned provider. Dropping it kills the process.
pub struct ProcessHandle {
    id: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit: ExitWatch,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Force-kill without waiting.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Force-kill and wait for the process to be reaped.
    pub async fn kill_and_wait(mut self) -> ExitInfo {
        self.kill();
        let mut exit = self.exit_watch();
        tokio::time::timeout(KILL_WAIT, exit.wait())
            .await
            .unwrap_or_else(|_| ExitInfo::unknown())
    }

    /// Ask the process to exit, then kill it if it is still alive after `grace`.
    pub async fn terminate(mut self, grace: Duration) -> ExitInfo {
        let mut exit = self.exit_watch();
        if !exit.has_exited() {
            self.signal_terminate();
        }

        match tokio::time::timeout(grace, exit.wait()).await {
            Ok(info) => info,
            Err(_) => {
                tracing::warn!(
                    server = %self.id,
                    grace_ms = millis(grace),
                    "provider did not exit within grace period, killing"
                );
                self.kill_and_wait().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(raw) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            tracing::debug!(server = %self.id, pid = raw, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        // Closing stdin is the only graceful request available here
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

// ─── Stderr Capture ─────────────────────────────────────────────────────────

/// Keeps the most recent stderr output of a provider.
pub struct StderrTail {
    tail: Arc<Mutex<String>>,
    task: Option<JoinHandle<()>>,
}

impl StderrTail {
    /// Start draining `stderr`, logging each line at debug level.
    pub fn capture(server: &str, stderr: Option<ChildStderr>) -> Self {
        let tail = Arc::new(Mutex::new(String::new()));
        let Some(stderr) = stderr else {
            return Self { tail, task: None };
        };

        let server = server.to_string();
        let sink = Arc::clone(&tail);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        tracing::debug!(
                            server = %server,
                            line = %line.trim_end(),
                            "provider stderr"
                        );
                        let mut tail = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        tail.push_str(&line);
                        keep_tail(&mut tail, STDERR_TAIL_CHARS);
                    }
                }
            }
        });

        Self {
            tail,
            task: Some(task),
        }
    }

    /// Current captured output.
    pub fn snapshot(&self) -> String {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait up to `wait` for stderr to reach EOF, then return what was captured.
    pub async fn finish(mut self, wait: Duration) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.snapshot()
    }
}

impl Drop for StderrTail {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drop leading content so that at most `max` bytes remain, on a char boundary.
fn keep_tail(buf: &mut String, max: usize) {
    if buf.len() <= max {
        return;
    }
    let mut start = buf.len() - max;
    while !buf.is_char_boundary(start) {
        start += 1;
    }
    buf.drain(..start);
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── Spawning ───────────────────────────────────────────────────────────────

/// A freshly spawned provider with its stdio split out.
pub struct SpawnedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: StderrTail,
    pub handle: ProcessHandle,
}

/// Spawn a provider process from its launch spec.
///
/// Missing required environment variables are logged, not rejected.
pub fn spawn_process(id: &str, spec: &LaunchSpec) -> Result<SpawnedProcess, SupervisorError> {
    let missing = spec.missing_env();
    if !missing.is_empty() {
        tracing::warn!(
            server = %id,
            missing = ?missing,
            "provider is missing required environment variables"
        );
    }

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = spec.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
        id: id.to_string(),
        reason: format!("{}: {e}", spec.command),
    })?;

    let stdin = child.stdin.take().ok_or(SupervisorError::SpawnFailed {
        id: id.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(SupervisorError::SpawnFailed {
        id: id.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = StderrTail::capture(id, child.stderr.take());
    let pid = child.id();

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = watch::channel(None);
    let server = id.to_string();

    // The watcher owns the child until it exits
    tokio::spawn(async move {
        let status = tokio::select! {
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(server = %server, error = %e, "kill failed");
                }
                child.wait().await
            }
            status = child.wait() => status,
        };
        let info = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                description: status.to_string(),
            },
            Err(e) => ExitInfo {
                code: None,
                description: format!("wait failed: {e}"),
            },
        };
        tracing::debug!(server = %server, status = %info, "provider process exited");
        let _ = exit_tx.send(Some(info));
    });

    tracing::debug!(server = %id, pid = ?pid, command = %spec.command, "provider spawned");

    Ok(SpawnedProcess {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr,
        handle: ProcessHandle {
            id: id.to_string(),
            pid,
            kill_tx: Some(kill_tx),
            exit: ExitWatch(exit_rx),
        },
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
