//! HTTP boundary: routes inbound traffic to backends and sessions.

use crate::error::{json_error_response, GatewayErrorCode};
use crate::proxy::ProxyManager;
use crate::session::SessionRegistry;
use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header carrying the session id (MCP streamable HTTP convention)
const MCP_SESSION_ID: &str = "mcp-session-id";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Shared handles the request path needs
#[derive(Clone)]
struct GatewayState {
    manager: Arc<ProxyManager>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
}

/// The gateway's HTTP server
pub struct GatewayServer {
    listener: TcpListener,
    state: GatewayState,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    /// Bind the listening socket. A bind failure here is fatal to the process.
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<ProxyManager>,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self {
            listener,
            state: GatewayState {
                manager,
                registry,
                idle_timeout,
            },
            shutdown_rx,
        })
    }

    /// The actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    _addr: SocketAddr,
    state: GatewayState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Inbound request");

    if let Some(server_name) = path.strip_prefix("/mcp/") {
        let server_name = server_name.trim_end_matches('/').to_string();
        return handle_mcp(req, &server_name, &state).await;
    }

    let response = match (&method, path.as_str()) {
        // List available servers
        (&Method::GET, "/") => {
            let servers: Vec<Value> = state
                .manager
                .backend_names()
                .into_iter()
                .map(|name| {
                    serde_json::json!({
                        "name": name,
                        "endpoint": format!("/mcp/{}", name),
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                serde_json::json!({"servers": servers}).to_string(),
            )
        }

        // Health check
        (&Method::GET, "/health") => {
            let counts = state.registry.counts(state.idle_timeout);
            let body = serde_json::json!({
                "status": "ok",
                "servers": state.manager.backend_names(),
                "sessions": counts,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Administrative purge: same sweep the reaper runs, synchronously
        (&Method::DELETE, "/sessions") => {
            let report = state.registry.sweep(state.idle_timeout);
            info!(
                purged = report.purged,
                remaining = report.remaining,
                "On-demand session purge"
            );
            let body = serde_json::json!({
                "purged": report.purged,
                "remaining": report.remaining,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Session-bearing MCP entry point for one backend
async fn handle_mcp(
    req: Request<Incoming>,
    server_name: &str,
    state: &GatewayState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let Some(backend) = state.manager.get_backend(server_name) else {
        return Ok(json_error_response(
            GatewayErrorCode::UnknownServer,
            format!("Server '{}' not found", server_name),
        ));
    };

    let session_header = req
        .headers()
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match req.method() {
        &Method::POST => {}
        &Method::DELETE => {
            // Explicit session termination, independent of idle eviction
            let closed = session_header
                .as_deref()
                .map(|id| state.registry.remove(id))
                .unwrap_or(false);
            return Ok(if closed {
                response(StatusCode::NO_CONTENT, Bytes::new())
            } else {
                json_error_response(GatewayErrorCode::SessionNotFound, "Unknown session id")
            });
        }
        _ => {
            return Ok(json_error_response(
                GatewayErrorCode::MethodNotAllowed,
                "Use POST for MCP messages and DELETE to end a session",
            ));
        }
    }

    if !backend.is_ready() {
        return Ok(json_error_response(
            GatewayErrorCode::ServerNotReady,
            format!("Server '{}' not ready", server_name),
        ));
    }

    // Known id: activity is refreshed inside the lookup, before the forward.
    // Absent or unrecognized id: create a fresh session against the backend.
    let session = match session_header.as_deref().and_then(|id| state.registry.get(id)) {
        Some(session) => session,
        None => state.registry.create(&backend),
    };

    let body = req.into_body().collect().await?.to_bytes();
    let message: Value = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            return Ok(json_error_response(
                GatewayErrorCode::InvalidBody,
                format!("Request body is not valid JSON: {}", e),
            ));
        }
    };

    match session.endpoint().handle(message).await {
        Ok(Some(frame)) => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .header(MCP_SESSION_ID, session.id())
                .body(Full::new(Bytes::from(frame.to_string())))
                .expect("valid response with StatusCode enum and session id header");
            Ok(response)
        }
        Ok(None) => {
            // Notification: accepted, nothing to return
            let response = Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(MCP_SESSION_ID, session.id())
                .body(Full::new(Bytes::new()))
                .expect("valid response with StatusCode enum and session id header");
            Ok(response)
        }
        Err(e) => {
            // The channel is gone; the session cannot be saved
            warn!(
                server = %server_name,
                session_id = %session.id(),
                error = %e,
                "Forwarding failed, closing session"
            );
            state.registry.remove(session.id());
            Ok(json_error_response(
                GatewayErrorCode::BackendUnreachable,
                format!("Backend '{}' unreachable", server_name),
            ))
        }
    }
}
