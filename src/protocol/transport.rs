//! Line-delimited JSON-RPC framing over a duplex byte stream.
//!
//! - Writing one JSON object per line to the child's stdin
//! - Reading one JSON object per line from the child's stdout
//! - Skipping blank and non-JSON lines (providers often log to stdout)

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::errors::ProtocolError;

/// Frames larger than this are discarded rather than parsed.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

// ─── Writer ─────────────────────────────────────────────────────────────────

/// Write half of a provider stream.
pub struct FrameWriter {
    server_name: String,
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(server_name: &str, inner: BoxedWriter) -> Self {
        Self {
            server_name: server_name.to_string(),
            inner,
        }
    }

    /// Serialize `message` and write it as a single line.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let line = encode_frame(&self.server_name, message)?;
        self.write_line(&line).await
    }

    /// Write an already encoded frame (see [`encode_frame`]).
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.inner
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProtocolError::Transport {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        self.inner
            .flush()
            .await
            .map_err(|e| ProtocolError::Transport {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    /// Close the write half. Providers treat stdin EOF as a shutdown request.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!(server = %self.server_name, error = %e, "stdin shutdown failed");
        }
    }
}

/// Serialize `message` as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(server_name: &str, message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(|e| ProtocolError::Transport {
        server: server_name.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Read half of a provider stream.
pub struct FrameReader {
    server_name: String,
    inner: BufReader<BoxedReader>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameReader {
    pub fn new(server_name: &str, inner: BoxedReader) -> Self {
        Self {
            server_name: server_name.to_string(),
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Read the next JSON frame. `Ok(None)` on EOF.
    ///
    /// At most `max_frame_bytes` of a line are buffered; the rest of an
    /// oversized line is consumed and dropped.
    pub async fn next_frame(&mut self) -> Result<Option<serde_json::Value>, ProtocolError> {
        loop {
            self.buf.clear();
            let limit = u64::try_from(self.max_frame_bytes)
                .unwrap_or(u64::MAX)
                .saturating_add(1);
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await;
            let bytes_read = read.map_err(|e| read_error(&self.server_name, e))?;

            if bytes_read == 0 {
                return Ok(None);
            }

            if bytes_read > self.max_frame_bytes && self.buf.last() != Some(&b'\n') {
                let skipped = self.skip_line().await?;
                tracing::warn!(
                    server = %self.server_name,
                    bytes = bytes_read + skipped,
                    limit = self.max_frame_bytes,
                    "discarding oversized frame"
                );
                continue;
            }

            let line = String::from_utf8_lossy(&self.buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(frame) => return Ok(Some(frame)),
                Err(_) => {
                    // Not JSON: most likely log output on stdout
                    tracing::debug!(
                        server = %self.server_name,
                        line = %truncate(trimmed, 200),
                        "skipping non-JSON line"
                    );
                }
            }
        }
    }
}

impl FrameReader {
    /// Consume input up to and including the next newline without buffering it.
    async fn skip_line(&mut self) -> Result<usize, ProtocolError> {
        let mut skipped = 0;
        loop {
            let available = self
                .inner
                .fill_buf()
                .await
                .map_err(|e| read_error(&self.server_name, e))?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.inner.consume(pos + 1);
                    return Ok(skipped + pos + 1);
                }
                None => {
                    let len = available.len();
                    self.inner.consume(len);
                    skipped += len;
                }
            }
        }
    }
}

fn read_error(server_name: &str, e: std::io::Error) -> ProtocolError {
    ProtocolError::Transport {
        server: server_name.to_string(),
        reason: format!("failed to read from stdout: {e}"),
    }
}

/// Truncate on a char boundary for log output.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::JsonRpcRequest;

    #[tokio::test]
    async fn test_writer_emits_one_line_per_message() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new("test", Box::new(client));
        writer
            .send(&JsonRpcRequest::new(1, "tools/list", None))
            .await
            .unwrap();
        writer
            .send(&JsonRpcRequest::new(2, "tools/list", None))
            .await
            .unwrap();
        writer.shutdown().await;

        let mut reader = FrameReader::new("test", Box::new(server));
        let first = reader.next_frame().await.unwrap().unwrap();
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(second["id"], 2);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_skips_noise() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"starting server...\n\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n")
            .await
            .unwrap();
        drop(tx);

        let mut reader = FrameReader::new("noisy", Box::new(rx));
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 3);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_drops_oversized_line_and_recovers() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let writer = tokio::spawn(async move {
            let long = format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"{}\"}}\n",
                "x".repeat(4096)
            );
            tx.write_all(long.as_bytes()).await.unwrap();
            tx.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n")
                .await
                .unwrap();
        });

        let mut reader = FrameReader::new("big", Box::new(rx)).with_max_frame_bytes(64);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["id"], 2);
        assert!(reader.buf.len() <= 65);
        writer.await.unwrap();
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_accepts_line_at_limit() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let frame = b"{\"jsonrpc\":\"2.0\",\"id\":7}";
        tx.write_all(frame).await.unwrap();
        tx.write_all(b"\n").await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new("edge", Box::new(rx)).with_max_frame_bytes(frame.len());
        assert_eq!(reader.next_frame().await.unwrap().unwrap()["id"], 7);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "héllo";
        assert_eq!(truncate(s, 2), "h");
        assert_eq!(truncate(s, 10), s);
    }
}
