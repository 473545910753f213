//! A small capability provider speaking line-delimited JSON-RPC on stdio.
//!
//! Used by the integration tests and handy for trying the supervisor by hand.
//!
//! Operations:
//! - `echo`: returns its arguments
//! - `search`: returns `{"results": [{"url": ...}, ...]}` (`count`, default 4)
//! - `fail`: reports an `isError` result
//! - `error`: answers with a JSON-RPC error
//! - `sleep`: waits `ms` milliseconds, then answers
//! - `pid`: returns the process id
//! - `crash`: exits immediately without answering
//! - `toggle_listing`: makes `tools/list` fail until toggled again
//!
//! Flags: `--reject-version`, `--no-handshake`, `--fail-start`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use capstack::config::LoggingConfig;
use capstack::logging::init_tracing;
use capstack::protocol::types::{error_codes, methods, PROTOCOL_VERSION};

#[derive(Debug, Default, Clone, Copy)]
struct Behavior {
    reject_version: bool,
    no_handshake: bool,
    fail_start: bool,
}

impl Behavior {
    fn from_args() -> anyhow::Result<Self> {
        let mut behavior = Self::default();
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--reject-version" => behavior.reject_version = true,
                "--no-handshake" => behavior.no_handshake = true,
                "--fail-start" => behavior.fail_start = true,
                other => anyhow::bail!("unknown flag '{other}'"),
            }
        }
        Ok(behavior)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol frames; logs go to stderr
    let _ = init_tracing(&LoggingConfig {
        filter: "capstack_echo_provider=debug,capstack=info".into(),
        ..LoggingConfig::default()
    });

    let behavior = Behavior::from_args()?;
    if behavior.fail_start {
        eprintln!("missing API key: set ECHO_API_KEY");
        std::process::exit(1);
    }

    let listing_broken = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            let mut line = serde_json::to_vec(&frame).context("encoding frame")?;
            line.push(b'\n');
            stdout.write_all(&line).await.context("writing frame")?;
            stdout.flush().await.context("flushing stdout")?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            tracing::warn!(line = %line, "ignoring non-JSON line");
            continue;
        };
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(id) = frame.get("id").cloned() else {
            tracing::debug!(method = %method, "notification");
            continue;
        };
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let tx = tx.clone();

        match method.as_str() {
            methods::INITIALIZE => {
                if behavior.no_handshake {
                    tracing::info!("withholding initialize response");
                    continue;
                }
                let version = if behavior.reject_version {
                    "1999-01-01"
                } else {
                    PROTOCOL_VERSION
                };
                let _ = tx.send(reply(
                    id,
                    json!({
                        "protocolVersion": version,
                        "capabilities": {"tools": {}},
                        "serverInfo": {
                            "name": "capstack-echo-provider",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    }),
                ));
            }
            methods::TOOLS_LIST => {
                let frame = if listing_broken.load(Ordering::SeqCst) {
                    error_reply(id, error_codes::INTERNAL_ERROR, "tool listing unavailable")
                } else {
                    reply(id, json!({"tools": tool_list()}))
                };
                let _ = tx.send(frame);
            }
            methods::TOOLS_CALL => {
                let listing_broken = Arc::clone(&listing_broken);
                // Each call runs on its own task so slow ones do not block the rest
                tokio::spawn(async move {
                    let name = params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let arguments = params
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    let frame = call_tool(id, name, arguments, &listing_broken).await;
                    let _ = tx.send(frame);
                });
            }
            other => {
                let _ = tx.send(error_reply(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    &format!("method not found: {other}"),
                ));
            }
        }
    }

    tracing::info!("stdin closed, exiting");
    drop(tx);
    writer.await.context("writer task")??;
    Ok(())
}

fn tool_list() -> Value {
    let tool = |name: &str, description: &str| {
        json!({"name": name, "description": description, "inputSchema": {"type": "object"}})
    };
    json!([
        tool("echo", "Return the arguments unchanged"),
        tool("search", "Return a list of result urls"),
        tool("fail", "Report a tool-level error"),
        tool("error", "Answer with a JSON-RPC error"),
        tool("sleep", "Wait before answering"),
        tool("pid", "Return the process id"),
        tool("crash", "Exit without answering"),
        tool("toggle_listing", "Make tools/list fail, or recover it"),
    ])
}

async fn call_tool(id: Value, name: &str, arguments: Value, listing_broken: &AtomicBool) -> Value {
    match name {
        "echo" => structured(id, arguments),
        "search" => {
            let count = arguments.get("count").and_then(Value::as_u64).unwrap_or(4);
            let results: Vec<Value> = (0..count)
                .map(|i| {
                    let label = char::from(b'a' + u8::try_from(i % 26).unwrap_or(0));
                    json!({"url": label.to_string(), "rank": i + 1})
                })
                .collect();
            structured(id, json!({"results": results, "query": arguments.get("q")}))
        }
        "fail" => reply(
            id,
            json!({
                "isError": true,
                "content": [{"type": "text", "text": "tool failed on purpose"}]
            }),
        ),
        "error" => error_reply(id, -32000, "provider error on purpose"),
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            structured(id, json!({"slept_ms": ms}))
        }
        "pid" => structured(id, json!({"pid": std::process::id()})),
        "toggle_listing" => {
            let broken = !listing_broken.fetch_xor(true, Ordering::SeqCst);
            structured(id, json!({"listing_broken": broken}))
        }
        "crash" => {
            tracing::warn!("crashing on request");
            std::process::exit(70);
        }
        other => error_reply(
            id,
            error_codes::INVALID_PARAMS,
            &format!("unknown tool: {other}"),
        ),
    }
}

fn structured(id: Value, content: Value) -> Value {
    reply(
        id,
        json!({
            "content": [{"type": "text", "text": content.to_string()}],
            "structuredContent": content
        }),
    )
}

fn reply(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_reply(id: Value, code: i32, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
