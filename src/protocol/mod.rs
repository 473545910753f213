//! JSON-RPC protocol sessions with capability providers.
//!
//! A provider is a child process speaking newline-delimited JSON-RPC 2.0 on
//! its stdin/stdout. This module covers:
//! - Framing (`transport`)
//! - Wire and handshake payloads (`types`)
//! - The session: handshake, enumeration, call correlation, close (`session`)

pub mod errors;
pub mod session;
pub mod transport;
pub mod types;

pub use errors::ProtocolError;
pub use session::ProtocolSession;
pub use transport::{BoxedReader, BoxedWriter};
pub use types::{HandshakeSummary, OperationDescriptor, ServerInfo};
