//! Crate-wide error taxonomy.
//!
//! Each component defines its own `thiserror` enum; every one of them maps
//! onto an [`ErrorKind`] so that callers (and workflow step records) can
//! branch on the failure class without matching component-specific variants.

use serde::{Deserialize, Serialize};

/// Failure class shared across discovery, supervision, sessions and workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A discovery source timed out or failed. Never surfaced as a call failure.
    DiscoverySourceUnavailable,
    /// The provider process could not be spawned.
    #[serde(rename = "spawn_failed")]
    SpawnFailure,
    /// The provider did not complete the handshake in time.
    HandshakeTimeout,
    /// The provider answered the handshake with an error or an unsupported version.
    HandshakeRejected,
    /// The session was closed (explicitly, by crash, or by shutdown).
    SessionClosed,
    /// A call did not receive its response before the deadline.
    CallTimeout,
    /// The provider returned a structured failure for an operation.
    ProviderReportedError,
    /// A workflow step input referenced data absent from the prior output.
    ReferenceResolutionError,
    /// The operation is not exposed by the provider.
    UnknownOperation,
    /// No launch spec is registered for the provider id.
    UnknownProvider,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case code, matching the serialized form.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::DiscoverySourceUnavailable => "discovery_source_unavailable",
            ErrorKind::SpawnFailure => "spawn_failed",
            ErrorKind::HandshakeTimeout => "handshake_timeout",
            ErrorKind::HandshakeRejected => "handshake_rejected",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::CallTimeout => "call_timeout",
            ErrorKind::ProviderReportedError => "provider_reported_error",
            ErrorKind::ReferenceResolutionError => "reference_resolution_error",
            ErrorKind::UnknownOperation => "unknown_operation",
            ErrorKind::UnknownProvider => "unknown_provider",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
