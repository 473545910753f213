//! Process supervisor error types.

use thiserror::Error;

use super::types::ProcessState;
use crate::errors::ErrorKind;
use crate::protocol::ProtocolError;

/// Errors from provider lifecycle operations and supervised calls.
///
/// Every variant carries the provider id; [`SupervisorError::phase`] names
/// the step that failed.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// No launch spec is registered under this id.
    #[error("no provider registered as '{id}'")]
    UnknownProvider { id: String },

    /// The OS refused to start the process.
    #[error("failed to spawn provider '{id}': {reason}")]
    SpawnFailed { id: String, reason: String },

    /// The process started but did not finish the handshake in time.
    #[error("provider '{id}' handshake timed out: {reason}")]
    HandshakeTimeout { id: String, reason: String },

    /// The process answered the handshake with an error or an unsupported version.
    #[error("provider '{id}' rejected the handshake: {reason}")]
    HandshakeRejected { id: String, reason: String },

    /// The provider has no live session.
    #[error("provider '{id}' is not running (state: {state})")]
    NotRunning { id: String, state: ProcessState },

    /// A call on the provider's session failed.
    #[error("provider '{id}': {source}")]
    Session {
        id: String,
        #[source]
        source: ProtocolError,
    },
}

impl SupervisorError {
    pub fn id(&self) -> &str {
        match self {
            SupervisorError::UnknownProvider { id }
            | SupervisorError::SpawnFailed { id, .. }
            | SupervisorError::HandshakeTimeout { id, .. }
            | SupervisorError::HandshakeRejected { id, .. }
            | SupervisorError::NotRunning { id, .. }
            | SupervisorError::Session { id, .. } => id,
        }
    }

    /// Lifecycle phase in which the error occurred.
    pub fn phase(&self) -> &'static str {
        match self {
            SupervisorError::UnknownProvider { .. } => "lookup",
            SupervisorError::SpawnFailed { .. } => "spawn",
            SupervisorError::HandshakeTimeout { .. }
            | SupervisorError::HandshakeRejected { .. } => "handshake",
            SupervisorError::NotRunning { .. } | SupervisorError::Session { .. } => "call",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::UnknownProvider { .. } => ErrorKind::UnknownProvider,
            SupervisorError::SpawnFailed { .. } => ErrorKind::SpawnFailure,
            SupervisorError::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            SupervisorError::HandshakeRejected { .. } => ErrorKind::HandshakeRejected,
            SupervisorError::NotRunning { .. } => ErrorKind::SessionClosed,
            SupervisorError::Session { source, .. } => source.kind(),
        }
    }

    /// Attach a provider id to a session error.
    pub fn session(id: &str, source: ProtocolError) -> Self {
        SupervisorError::Session {
            id: id.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_phase() {
        let err = SupervisorError::HandshakeTimeout {
            id: "fetch".into(),
            reason: "no answer".into(),
        };
        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(err.phase(), "handshake");
        assert_eq!(err.id(), "fetch");
    }

    #[test]
    fn test_session_error_kind_passes_through() {
        let err = SupervisorError::session(
            "search",
            ProtocolError::CallTimeout {
                server: "search".into(),
                operation: "query".into(),
                timeout_ms: 10,
            },
        );
        assert_eq!(err.kind(), ErrorKind::CallTimeout);
        assert_eq!(err.phase(), "call");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_not_running_is_session_closed() {
        let err = SupervisorError::NotRunning {
            id: "x".into(),
            state: ProcessState::Crashed,
        };
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert!(err.to_string().contains("crashed"));
    }
}
