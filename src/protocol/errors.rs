//! Protocol session error types.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors that can occur on a protocol session.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The handshake did not complete before its deadline.
    #[error("server '{server}' did not complete the handshake within {timeout_ms}ms")]
    HandshakeTimeout { server: String, timeout_ms: u64 },

    /// The provider answered the handshake with an error or an incompatible version.
    #[error("server '{server}' rejected the handshake: {reason}")]
    HandshakeRejected { server: String, reason: String },

    /// The session is no longer usable.
    #[error("session for server '{server}' is closed")]
    SessionClosed { server: String },

    /// No correlated response arrived before the deadline.
    #[error("call '{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    CallTimeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The provider returned a structured failure.
    #[error("server '{server}' reported an error for '{operation}' [{code}]: {message}")]
    ProviderReported {
        server: String,
        operation: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The operation is not among the enumerated capabilities.
    #[error("server '{server}' does not expose operation '{operation}'")]
    UnknownOperation { server: String, operation: String },

    /// Writing to or framing for the stream failed.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            ProtocolError::HandshakeRejected { .. } => ErrorKind::HandshakeRejected,
            // A broken stream is indistinguishable from a closed one for callers
            ProtocolError::SessionClosed { .. } | ProtocolError::Transport { .. } => {
                ErrorKind::SessionClosed
            }
            ProtocolError::CallTimeout { .. } => ErrorKind::CallTimeout,
            ProtocolError::ProviderReported { .. } => ErrorKind::ProviderReportedError,
            ProtocolError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
        }
    }
}
