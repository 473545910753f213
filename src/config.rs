//! Core configuration loading.
//!
//! Reads `capstack.yaml` and resolves environment variables. Every field has
//! a default, so an empty file (or no file at all) yields a working config
//! with no discovery sources and no registered providers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::federation::{ProvenanceTag, RegistryEntry};
use crate::supervisor::LaunchSpec;

/// File name searched for when walking upward.
pub const CONFIG_FILE_NAME: &str = "capstack.yaml";

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CAPSTACK_CONFIG";

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors raised while locating or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find capstack.yaml above {}", searched_from.display())]
    NotFound { searched_from: PathBuf },

    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

// ─── Public Types ───────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `capstack.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub federation: FederationConfig,
    pub supervisor: SupervisorConfig,
    /// Backend registry: provider id → launch spec.
    pub providers: BTreeMap<String, LaunchSpec>,
    pub logging: LoggingConfig,
}

/// Discovery sources and their time budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Queried in this order; earlier sources win launch-spec disagreements.
    pub sources: Vec<SourceConfig>,
    /// Per-source timeout (default: 5s).
    pub source_timeout_ms: u64,
    /// Deadline for the whole fan-out (default: 15s).
    pub deadline_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            source_timeout_ms: 5_000,
            deadline_ms: 15_000,
        }
    }
}

impl FederationConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// One discovery source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A JSON registry reachable over HTTP.
    Http {
        name: String,
        provenance: ProvenanceTag,
        url: String,
    },
    /// A fixed list of entries (curated lists, pinned servers).
    Static {
        name: String,
        provenance: ProvenanceTag,
        #[serde(default)]
        entries: Vec<RegistryEntry>,
    },
}

/// Timeouts applied by the process supervisor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bound on spawn + handshake + enumeration (default: 30s).
    pub handshake_timeout_ms: u64,
    /// Default bound on a single call (default: 30s).
    pub call_timeout_ms: u64,
    /// Time between SIGTERM and force-kill on stop (default: 5s).
    pub stop_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging setup consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
    pub format: LogFormat,
    /// Write to a rotated file in the data directory instead of stderr.
    pub file: bool,
    /// Overrides the platform data directory for the log file.
    pub directory: Option<String>,
    /// Rotated files kept besides the live one.
    pub keep_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "capstack=info,warn".to_string(),
            format: LogFormat::Text,
            file: false,
            directory: None,
            keep_files: 5,
        }
    }
}

/// Whole milliseconds in `d`, saturating.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `CAPSTACK_CONFIG` wins when it names an existing file; otherwise searches
/// upward from `start` for `capstack.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    let explicit = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
    find_config_path_from(start, explicit)
}

fn find_config_path_from(start: &Path, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    // 1. Explicit path
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(
            path = %path.display(),
            "CAPSTACK_CONFIG does not name a file, searching upward"
        );
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound {
        searched_from: start.to_path_buf(),
    })
}

/// Load and parse a config file.
///
/// Performs environment-variable interpolation on `${VAR}` and
/// `${VAR:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_config(&raw, path)
}

/// Locate and load the config, falling back to defaults when there is none.
pub fn load_or_default(start: &Path) -> Result<CoreConfig, ConfigError> {
    match find_config_path(start) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            load_config(&path)
        }
        Err(ConfigError::NotFound { .. }) => {
            tracing::info!("no capstack.yaml found, using defaults");
            Ok(CoreConfig::default())
        }
        Err(e) => Err(e),
    }
}

fn parse_config(raw: &str, path: &Path) -> Result<CoreConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    // An empty document parses as null, not as an empty mapping
    if interpolated.trim().is_empty() {
        return Ok(CoreConfig::default());
    }

    let mut config: CoreConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    for spec in config.providers.values_mut() {
        if let Some(cwd) = spec.cwd.as_mut() {
            *cwd = expand_tilde(cwd);
        }
    }
    if let Some(dir) = config.logging.directory.as_mut() {
        *dir = expand_tilde(dir);
    }

    Ok(config)
}

// ─── Env-var interpolation ──────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
