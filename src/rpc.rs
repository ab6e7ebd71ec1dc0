//! JSON-RPC 2.0 client link to a backend process.
//!
//! Frames are newline-delimited JSON over any `AsyncWrite`/`AsyncRead` pair
//! (child stdio in production, duplex pipes in tests). A reader task routes
//! each response to its waiting caller by request id, so concurrent calls
//! from many sessions can interleave on the one shared channel.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// JSON-RPC version sent on every frame
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision negotiated during the handshake
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC error code: the method does not exist / is not available
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code: the JSON sent is not a valid request object
pub const INVALID_REQUEST: i64 = -32600;

/// Error type for client link operations
#[derive(Debug, Error)]
pub enum RpcError {
    /// The backend answered with a JSON-RPC error object, passed through verbatim
    #[error("backend error: {0}")]
    Backend(Value),
    /// The underlying channel is closed
    #[error("backend channel closed")]
    ChannelClosed,
    /// The backend rejected the initialize handshake
    #[error("handshake rejected by backend: {0}")]
    Handshake(String),
    /// The initialize handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// I/O failure writing to the channel
    #[error("i/o error on backend channel: {0}")]
    Io(#[from] std::io::Error),
    /// Frame could not be encoded
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Build a JSON-RPC result frame
pub fn response_frame(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

/// Build a JSON-RPC error frame
pub fn error_frame(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {"code": code, "message": message},
    })
}

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

struct Shared {
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: AtomicBool,
}

impl Shared {
    /// Fail every outstanding call; used on EOF and on explicit close
    fn drain_pending(&self) {
        let waiters: Vec<(u64, Waiter)> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(RpcError::ChannelClosed));
        }
    }
}

/// Client side of one backend's private channel.
///
/// Shared behind an `Arc` by every forwarding endpoint targeting the backend.
/// Outstanding calls are correlated by request id, so interleaved calls from
/// different sessions each receive their own response.
pub struct RpcClient {
    name: String,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect over the given channel and perform the MCP initialize handshake.
    ///
    /// Returns the client and the raw initialize result (capabilities included).
    pub async fn connect<W, R>(
        writer: W,
        reader: R,
        client_name: &str,
        handshake_timeout: Duration,
    ) -> Result<(Arc<Self>, Value), RpcError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let client = Arc::new(Self {
            name: client_name.to_string(),
            shared: Arc::clone(&shared),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(read_loop(reader, client_name.to_string(), shared));

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": client_name, "version": env!("CARGO_PKG_VERSION")},
        });

        let init_result =
            tokio::time::timeout(handshake_timeout, client.request("initialize", params))
                .await
                .map_err(|_| RpcError::HandshakeTimeout)?
                .map_err(|e| match e {
                    RpcError::Backend(err) => RpcError::Handshake(err.to_string()),
                    other => other,
                })?;

        client
            .notify("notifications/initialized", Value::Null)
            .await?;

        Ok((client, init_result))
    }

    /// Send a request and await its correlated response.
    ///
    /// A JSON-RPC error from the backend comes back as `RpcError::Backend`
    /// with the error object untouched.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let mut frame = json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method});
        if !params.is_null() {
            frame["params"] = params;
        }

        if let Err(e) = self.write_frame(&frame).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::ChannelClosed),
        }
    }

    /// Send a fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let mut frame = json!({"jsonrpc": JSONRPC_VERSION, "method": method});
        if !params.is_null() {
            frame["params"] = params;
        }
        self.write_frame(&frame).await
    }

    // Per-category call methods; each forwards its params value verbatim.

    pub async fn list_tools(&self, params: Value) -> Result<Value, RpcError> {
        self.request("tools/list", params).await
    }

    pub async fn call_tool(&self, params: Value) -> Result<Value, RpcError> {
        self.request("tools/call", params).await
    }

    pub async fn list_resources(&self, params: Value) -> Result<Value, RpcError> {
        self.request("resources/list", params).await
    }

    pub async fn read_resource(&self, params: Value) -> Result<Value, RpcError> {
        self.request("resources/read", params).await
    }

    pub async fn list_resource_templates(&self, params: Value) -> Result<Value, RpcError> {
        self.request("resources/templates/list", params).await
    }

    pub async fn list_prompts(&self, params: Value) -> Result<Value, RpcError> {
        self.request("prompts/list", params).await
    }

    pub async fn get_prompt(&self, params: Value) -> Result<Value, RpcError> {
        self.request("prompts/get", params).await
    }

    pub async fn ping(&self) -> Result<Value, RpcError> {
        self.request("ping", Value::Null).await
    }

    /// Close the link: drop the writer (EOF to the backend) and fail all
    /// outstanding calls. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writer.lock().await.take();
        self.shared.drain_pending();
        debug!(server = %self.name, "Client link closed");
    }

    /// Whether the channel is closed (locally or by backend EOF)
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcError::ChannelClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Reader task: routes each inbound frame to its waiting caller.
async fn read_loop<R>(reader: R, name: String, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => route_message(&name, &shared, message),
                    Err(e) => {
                        warn!(server = %name, error = %e, "Discarding unparseable frame from backend");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %name, error = %e, "Error reading from backend channel");
                break;
            }
        }
    }

    debug!(server = %name, "Backend channel reached EOF");
    shared.closed.store(true, Ordering::SeqCst);
    shared.drain_pending();
}

fn route_message(name: &str, shared: &Shared, message: Value) {
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        if message.get("result").is_some() || message.get("error").is_some() {
            let waiter = shared.pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let outcome = if let Some(err) = message.get("error") {
                        Err(RpcError::Backend(err.clone()))
                    } else {
                        Ok(message.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(outcome);
                }
                None => {
                    debug!(server = %name, id, "Response for unknown request id");
                }
            }
            return;
        }

        // Server-to-client requests (sampling etc.) are not supported here
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("<none>");
        warn!(server = %name, method, "Ignoring request initiated by backend");
        return;
    }

    let method = message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("<none>");
    debug!(server = %name, method, "Dropping backend notification");
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake stdio backend for unit tests, driven over duplex pipes.

    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    pub(crate) async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, frame: &Value) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        w.write_all(line.as_bytes()).await.unwrap();
    }

    /// Runs a scripted backend on one end of a duplex pipe:
    /// - `initialize` answered with the given capabilities
    /// - `test/hold` buffered, answered after the next ordinary request
    /// - `test/error` answered with a -32000 error
    /// - anything else echoed back as `{"echo": {"method", "params"}}`
    pub(crate) async fn run_fake_backend(stream: DuplexStream, caps: Value) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut held: Vec<Value> = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            let message: Value = match serde_json::from_str(&line) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let method = message
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let Some(id) = message.get("id").cloned() else {
                continue; // notification
            };

            match method.as_str() {
                "initialize" => {
                    let reply = response_frame(
                        &id,
                        json!({
                            "protocolVersion": PROTOCOL_VERSION,
                            "capabilities": caps,
                            "serverInfo": {"name": "fake-backend", "version": "0.0.0"},
                        }),
                    );
                    write_line(&mut writer, &reply).await;
                }
                "test/hold" => held.push(id),
                "test/error" => {
                    write_line(&mut writer, &error_frame(&id, -32000, "boom")).await;
                }
                "tools/call" if message["params"]["name"] == "fail" => {
                    write_line(&mut writer, &error_frame(&id, -32000, "tool failed")).await;
                }
                _ => {
                    let reply = response_frame(
                        &id,
                        json!({"echo": {
                            "method": method,
                            "params": message.get("params").cloned().unwrap_or(Value::Null),
                        }}),
                    );
                    write_line(&mut writer, &reply).await;
                    for held_id in held.drain(..) {
                        write_line(&mut writer, &response_frame(&held_id, json!({"held": true})))
                            .await;
                    }
                }
            }
        }
    }

    /// Duplex-backed client connected to the fake backend
    pub(crate) async fn connected_client(caps: Value) -> Arc<RpcClient> {
        let (proxy_side, backend_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_fake_backend(backend_side, caps));
        let (reader, writer) = tokio::io::split(proxy_side);
        let (client, _init) =
            RpcClient::connect(writer, reader, "mcpgate/test", Duration::from_secs(5))
                .await
                .unwrap();
        client
    }
}
