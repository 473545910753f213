//! Protocol session over one provider's duplex stream.
//!
//! A session owns a single read-loop task that demultiplexes incoming frames
//! by correlation id into a table of pending one-shot slots, and a single
//! writer task that drains an outbound queue onto the provider's stdin.
//! Any number of callers may have requests in flight at once; each waits on
//! its own slot with its own deadline, which also bounds a provider that has
//! stopped reading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::errors::ProtocolError;
use super::transport::{encode_frame, BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use super::types::{
    error_codes, extract_call_output, initialize_params, methods, HandshakeSummary, Incoming,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, ListOperationsResult,
    OperationDescriptor, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::config::millis;
use crate::value::Value;

type Reply = Result<serde_json::Value, JsonRpcError>;

/// Upper bound on `tools/list` pages followed during enumeration.
const MAX_LIST_PAGES: usize = 64;

/// How long `close` lets queued frames drain before abandoning the writer.
const CLOSE_FLUSH: Duration = Duration::from_millis(500);

// ─── Shared State ───────────────────────────────────────────────────────────

/// State shared between the session handle and its read loop.
struct Shared {
    server_name: String,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    closed: CancellationToken,
    /// Encoded frames for the writer task. Taken on close.
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a slot for `id`. `None` once the session is closed.
    fn register(&self, id: u64) -> Option<oneshot::Receiver<Reply>> {
        let mut pending = self.pending();
        if self.closed.is_cancelled() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let previous = pending.insert(id, tx);
        assert!(
            previous.is_none(),
            "correlation id {id} reused while a request was outstanding"
        );
        Some(rx)
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.pending().remove(&id)
    }

    /// Queue an encoded frame for the writer task. `false` once closed.
    fn enqueue(&self, line: String) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(line).is_ok())
    }

    /// Mark closed, release the outbound queue and fail every outstanding slot.
    fn close(&self) -> usize {
        self.closed.cancel();
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let drained: Vec<_> = self.pending().drain().collect();
        // Dropping the senders wakes every waiter with a closed-channel error
        drained.len()
    }
}

/// Removes a pending slot when the waiting call finishes, however it finishes.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.take(self.id);
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// A JSON-RPC session with one capability provider.
pub struct ProtocolSession {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    capabilities: OnceLock<Vec<OperationDescriptor>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolSession {
    /// Bind a session to a provider's stdout (`reader`) and stdin (`writer`)
    /// and start its read and write loops. Must be called inside a tokio runtime.
    pub fn new(server_name: &str, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            outbox: Mutex::new(Some(outbox_tx)),
        });

        let frames = FrameReader::new(server_name, reader);
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), frames));
        let writer_task = tokio::spawn(write_loop(
            Arc::clone(&shared),
            FrameWriter::new(server_name, writer),
            outbox_rx,
        ));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            capabilities: OnceLock::new(),
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session closes, for whatever reason.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.shared.closed.clone().cancelled_owned()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Operations enumerated during the handshake, if it has completed.
    pub fn capabilities(&self) -> Option<&[OperationDescriptor]> {
        self.capabilities.get().map(Vec::as_slice)
    }

    /// Perform the `initialize` exchange and enumerate operations.
    ///
    /// The whole exchange is bounded by `timeout`.
    pub async fn handshake(&self, timeout: Duration) -> Result<HandshakeSummary, ProtocolError> {
        let timeout_ms = millis(timeout);
        let summary = match tokio::time::timeout(timeout, self.handshake_inner(timeout)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProtocolError::HandshakeTimeout {
                    server: self.shared.server_name.clone(),
                    timeout_ms,
                })
            }
        };

        let _ = self.capabilities.set(summary.operations.clone());

        tracing::info!(
            server = %self.shared.server_name,
            protocol_version = %summary.protocol_version,
            operations = summary.operations.len(),
            "handshake complete"
        );
        Ok(summary)
    }

    async fn handshake_inner(&self, timeout: Duration) -> Result<HandshakeSummary, ProtocolError> {
        let server = self.shared.server_name.clone();
        let rejected = |reason: String| ProtocolError::HandshakeRejected {
            server: server.clone(),
            reason,
        };

        let raw = self
            .request(
                methods::INITIALIZE,
                Some(initialize_params()),
                timeout,
                methods::INITIALIZE,
            )
            .await
            .map_err(|e| self.handshake_failure(e, timeout))?;

        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| rejected(format!("malformed initialize response: {e}")))?;

        let protocol_version = init
            .protocol_version
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version.as_str()) {
            return Err(rejected(format!(
                "unsupported protocol version '{protocol_version}'"
            )));
        }

        self.notify(methods::INITIALIZED, None)?;

        let operations = self
            .list_operations(timeout)
            .await
            .map_err(|e| self.handshake_failure(e, timeout))?;

        Ok(HandshakeSummary {
            protocol_version,
            server_info: init.server_info.unwrap_or_default(),
            operations,
        })
    }

    /// Map a request failure during the handshake onto the handshake taxonomy.
    fn handshake_failure(&self, error: ProtocolError, timeout: Duration) -> ProtocolError {
        let server = self.shared.server_name.clone();
        match error {
            ProtocolError::CallTimeout { .. } => ProtocolError::HandshakeTimeout {
                server,
                timeout_ms: millis(timeout),
            },
            ProtocolError::ProviderReported { code, message, .. } => {
                ProtocolError::HandshakeRejected {
                    server,
                    reason: format!("[{code}] {message}"),
                }
            }
            ProtocolError::SessionClosed { .. } => ProtocolError::HandshakeRejected {
                server,
                reason: "provider closed its output before completing the handshake".into(),
            },
            other => other,
        }
    }

    /// Re-enumerate the provider's operations.
    ///
    /// Follows `nextCursor` pagination. A provider without `tools/list`
    /// exposes no operations.
    pub async fn list_operations(
        &self,
        timeout: Duration,
    ) -> Result<Vec<OperationDescriptor>, ProtocolError> {
        let mut operations = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let raw = match self
                .request(methods::TOOLS_LIST, params, timeout, methods::TOOLS_LIST)
                .await
            {
                Ok(raw) => raw,
                Err(ProtocolError::ProviderReported { code, .. })
                    if code == error_codes::METHOD_NOT_FOUND =>
                {
                    return Ok(operations);
                }
                Err(e) => return Err(e),
            };

            let page: ListOperationsResult =
                serde_json::from_value(raw).map_err(|e| ProtocolError::ProviderReported {
                    server: self.shared.server_name.clone(),
                    operation: methods::TOOLS_LIST.to_string(),
                    code: error_codes::PARSE_ERROR,
                    message: format!("malformed tools/list response: {e}"),
                    data: None,
                })?;

            operations.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(operations),
            }
        }

        tracing::warn!(
            server = %self.shared.server_name,
            pages = MAX_LIST_PAGES,
            "operation enumeration stopped at page limit"
        );
        Ok(operations)
    }

    /// Invoke `operation` with `input` and wait for its output.
    pub async fn call(
        &self,
        operation: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        if let Some(caps) = self.capabilities() {
            if !caps.iter().any(|op| op.name == operation) {
                return Err(ProtocolError::UnknownOperation {
                    server: self.shared.server_name.clone(),
                    operation: operation.to_string(),
                });
            }
        }

        let arguments = match input {
            Value::Null => serde_json::json!({}),
            other => serde_json::Value::from(other.clone()),
        };
        let params = serde_json::json!({ "name": operation, "arguments": arguments });

        let raw = self
            .request(methods::TOOLS_CALL, Some(params), timeout, operation)
            .await?;

        extract_call_output(raw).map_err(|message| ProtocolError::ProviderReported {
            server: self.shared.server_name.clone(),
            operation: operation.to_string(),
            // isError results carry no JSON-RPC code
            code: 0,
            message,
            data: None,
        })
    }

    /// Send a request and wait for the correlated response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        operation: &str,
    ) -> Result<serde_json::Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self
            .shared
            .register(id)
            .ok_or_else(|| self.closed_error())?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // Queued, not written: the deadline below covers a stalled stdin too
        self.send_frame(&JsonRpcRequest::new(id, method, params))?;

        tracing::debug!(server = %self.shared.server_name, id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(ProtocolError::ProviderReported {
                server: self.shared.server_name.clone(),
                operation: operation.to_string(),
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(ProtocolError::CallTimeout {
                server: self.shared.server_name.clone(),
                operation: operation.to_string(),
                timeout_ms: millis(timeout),
            }),
        }
    }

    fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), ProtocolError> {
        self.send_frame(&JsonRpcNotification::new(method, params))
    }

    fn send_frame<T: serde::Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let line = encode_frame(&self.shared.server_name, message)?;
        if self.shared.enqueue(line) {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Close the session: fail pending calls, stop the read loop, close stdin.
    ///
    /// Frames already queued get a short window to drain. A writer stuck on
    /// a provider that stopped reading is aborted, which drops stdin.
    pub async fn close(&self) {
        let failed = self.shared.close();
        self.abort_reader();
        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = writer {
            if tokio::time::timeout(CLOSE_FLUSH, &mut task).await.is_err() {
                tracing::debug!(server = %self.shared.server_name, "abandoning stalled writer");
                task.abort();
            }
        }
        tracing::debug!(
            server = %self.shared.server_name,
            failed_pending = failed,
            "session closed"
        );
    }

    fn abort_reader(&self) {
        abort_task(&self.reader_task);
    }

    fn closed_error(&self) -> ProtocolError {
        ProtocolError::SessionClosed {
            server: self.shared.server_name.clone(),
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.shared.close();
        self.abort_reader();
        abort_task(&self.writer_task);
    }
}

fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(task) = task {
        task.abort();
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("server", &self.shared.server_name)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ─── Read Loop ──────────────────────────────────────────────────────────────

async fn read_loop(shared: Arc<Shared>, mut frames: FrameReader) {
    loop {
        let frame = match frames.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(server = %shared.server_name, "provider closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %shared.server_name, error = %e, "read loop failed");
                break;
            }
        };

        match Incoming::classify(frame) {
            Incoming::Response { id, outcome } => match shared.take(id) {
                Some(slot) => {
                    // The waiter may have timed out in the meantime
                    let _ = slot.send(outcome);
                }
                None => {
                    tracing::warn!(
                        server = %shared.server_name,
                        id,
                        "dropping response with unknown correlation id"
                    );
                }
            },
            Incoming::UncorrelatedResponse { id } => {
                tracing::warn!(
                    server = %shared.server_name,
                    id = %id,
                    "dropping response with unknown correlation id"
                );
            }
            Incoming::Request { id, method } => {
                tracing::debug!(
                    server = %shared.server_name,
                    method = %method,
                    "rejecting server request"
                );
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("method not found: {method}"),
                    },
                });
                let queued = encode_frame(&shared.server_name, &reply)
                    .map(|line| shared.enqueue(line))
                    .unwrap_or(false);
                if !queued {
                    tracing::debug!(
                        server = %shared.server_name,
                        "could not reply to server request"
                    );
                }
            }
            Incoming::Notification { method } => {
                tracing::debug!(server = %shared.server_name, method = %method, "notification");
            }
            Incoming::Unrecognized => {
                tracing::debug!(server = %shared.server_name, "skipping non-JSON-RPC frame");
            }
        }
    }

    let failed = shared.close();
    if failed > 0 {
        tracing::warn!(
            server = %shared.server_name,
            failed_pending = failed,
            "stream ended with requests outstanding"
        );
    }
}

// ─── Write Loop ─────────────────────────────────────────────────────────────

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: FrameWriter,
    mut outbox: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = outbox.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            tracing::warn!(server = %shared.server_name, error = %e, "write loop failed");
            let failed = shared.close();
            if failed > 0 {
                tracing::warn!(
                    server = %shared.server_name,
                    failed_pending = failed,
                    "stdin broke with requests outstanding"
                );
            }
            return;
        }
    }
    // Queue released by close: signal EOF on stdin
    writer.shutdown().await;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
