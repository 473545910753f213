//! Discovery source error types.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors a single discovery source can report.
///
/// None of these escape a federated search; they become degraded-source
/// records instead.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// Connecting to or talking with the source failed.
    #[error("source '{source_name}' request to {url} failed: {reason}")]
    Http {
        source_name: String,
        url: String,
        reason: String,
    },

    /// The source did not answer before its deadline.
    #[error("source '{source_name}' timed out after {timeout_ms}ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    /// Non-2xx HTTP response.
    #[error("source '{source_name}' returned HTTP {status}: {body}")]
    Status {
        source_name: String,
        status: u16,
        body: String,
    },

    /// The response body was not a recognizable listing.
    #[error("source '{source_name}' returned an unreadable listing: {reason}")]
    Decode { source_name: String, reason: String },
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DiscoverySourceUnavailable
    }

    pub fn source_name(&self) -> &str {
        match self {
            DiscoveryError::Http { source_name, .. }
            | DiscoveryError::Timeout { source_name, .. }
            | DiscoveryError::Status { source_name, .. }
            | DiscoveryError::Decode { source_name, .. } => source_name,
        }
    }
}
