//! Tracing subscriber setup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

pub const LOG_FILE_NAME: &str = "capstack.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {reason}")]
    OpenLog { path: String, reason: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Platform data directory for capstack.
///
/// Falls back to `~/.capstack/` when the platform has no data directory.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("capstack");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".capstack")
}

/// Install the global subscriber.
///
/// With `file` enabled, rotates `capstack.log` (keeping `keep_files` old
/// copies) and writes there through a line-flushing writer; otherwise writes
/// to stderr so stdout stays free for protocol traffic. Returns the log file
/// path when one is used.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<PathBuf>, LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (writer, log_path) = if config.file {
        let dir = config
            .directory
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(data_dir);
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(LOG_FILE_NAME);
        rotate_log_file(&path, config.keep_files);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LoggingError::OpenLog {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        (BoxMakeWriter::new(FlushingWriter::new(file)), Some(path))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)?;

    let destination = log_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stderr".to_string());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %destination,
        pid = std::process::id(),
        "=== capstack starting ==="
    );
    Ok(log_path)
}

/// Rotate `capstack.log` → `.1` → `.2` … → `.{keep}`, dropping the oldest.
///
/// Missing files in the chain are skipped. `keep == 0` just removes the
/// current file.
pub fn rotate_log_file(base_path: &Path, keep: usize) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let numbered = |i: usize| PathBuf::from(format!("{}.{i}", base_path.display()));
    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// A file writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
