//! Backend connection: one stdio MCP server process and its client link.

use crate::config::ServerConfig;
use crate::endpoint::ForwardingEndpoint;
use crate::rpc::RpcClient;
use anyhow::Context;
use parking_lot::Mutex;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Protocol-operation categories a backend advertised at handshake time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl CapabilitySet {
    /// Extract the capability flags from an MCP initialize result
    pub fn from_initialize(result: &Value) -> Self {
        let caps = &result["capabilities"];
        Self {
            tools: caps.get("tools").is_some_and(Value::is_object),
            resources: caps.get("resources").is_some_and(Value::is_object),
            prompts: caps.get("prompts").is_some_and(Value::is_object),
        }
    }

    /// Capability object advertised to external callers on their own initialize
    pub fn advertised(&self) -> Value {
        let mut caps = serde_json::Map::new();
        if self.tools {
            caps.insert("tools".to_string(), serde_json::json!({}));
        }
        if self.resources {
            caps.insert("resources".to_string(), serde_json::json!({}));
        }
        if self.prompts {
            caps.insert("prompts".to_string(), serde_json::json!({}));
        }
        Value::Object(caps)
    }
}

/// One configured backend: the owned child process, the shared client link,
/// a readiness flag, and the capabilities negotiated at handshake time.
///
/// Created once per configured name at startup and destroyed at shutdown;
/// every session targeting the backend shares this connection.
pub struct BackendConnection {
    name: String,
    child: Mutex<Option<Child>>,
    client: Arc<RpcClient>,
    ready: AtomicBool,
    capabilities: CapabilitySet,
}

impl BackendConnection {
    /// Launch the backend process and perform the protocol handshake.
    ///
    /// A launch or handshake failure is a connection error for this backend
    /// only; callers must not abort startup of sibling connections over it.
    pub async fn start(
        name: &str,
        config: &ServerConfig,
        handshake_timeout: Duration,
    ) -> anyhow::Result<Self> {
        info!(server = name, command = %config.command, "Starting backend");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Environment overlay on top of the inherited environment
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to launch '{}' for backend '{}'", config.command, name))?;
        let pid = child.id().unwrap_or(0);

        let stdin = child
            .stdin
            .take()
            .context("backend stdin not piped")?;
        let stdout = child
            .stdout
            .take()
            .context("backend stdout not piped")?;

        // Stdio servers log to stderr; relay it into our own logs
        if let Some(stderr) = child.stderr.take() {
            let stderr_name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %stderr_name, "stderr: {}", line);
                }
            });
        }

        let client_name = format!("mcpgate/{}", name);
        let (client, init_result) =
            RpcClient::connect(stdin, stdout, &client_name, handshake_timeout)
                .await
                .with_context(|| format!("Handshake with backend '{}' failed", name))?;

        let capabilities = CapabilitySet::from_initialize(&init_result);
        info!(
            server = name,
            pid,
            tools = capabilities.tools,
            resources = capabilities.resources,
            prompts = capabilities.prompts,
            "Backend connected"
        );

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            client,
            ready: AtomicBool::new(true),
            capabilities,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connection accepts forwarded calls
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Build a forwarding endpoint bound to this connection's shared channel.
    ///
    /// Each session gets its own endpoint; all of them funnel onto the one
    /// client link, which correlates interleaved calls by request id.
    pub fn create_forwarding_endpoint(&self) -> ForwardingEndpoint {
        ForwardingEndpoint::new(&self.name, self.capabilities, Arc::clone(&self.client))
    }

    /// Stop the backend: clear readiness, close the client link, then wait
    /// for the process to exit, escalating to SIGTERM and finally SIGKILL.
    /// Idempotent; all failures are logged and swallowed.
    pub async fn stop(&self, grace_period: Duration) {
        self.ready.store(false, Ordering::SeqCst);
        self.client.close().await;

        let child = self.child.lock().take();
        let Some(mut child) = child else {
            debug!(server = %self.name, "Backend already stopped");
            return;
        };

        // Closing stdin is the usual shutdown signal for a stdio server
        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(server = %self.name, ?status, "Backend process exited");
                return;
            }
            Ok(Err(e)) => {
                warn!(server = %self.name, error = %e, "Error waiting for backend to exit");
                return;
            }
            Err(_) => {}
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            warn!(server = %self.name, pid, "Grace period exceeded, sending SIGTERM");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(_) => return,
                Err(_) => {}
            }
        }

        warn!(server = %self.name, "Backend did not exit, killing");
        if let Err(e) = child.kill().await {
            warn!(server = %self.name, error = %e, "Failed to kill backend process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capabilities_from_initialize() {
        let result = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {
                "tools": {"listChanged": true},
                "prompts": {}
            },
            "serverInfo": {"name": "echo", "version": "1.0.0"}
        });

        let caps = CapabilitySet::from_initialize(&result);
        assert!(caps.tools);
        assert!(!caps.resources);
        assert!(caps.prompts);
    }

    #[test]
    fn test_capabilities_from_empty_initialize() {
        let caps = CapabilitySet::from_initialize(&json!({}));
        assert_eq!(caps, CapabilitySet::default());
        assert!(!caps.tools);
    }

    #[test]
    fn test_capabilities_ignore_non_object_flags() {
        let result = json!({"capabilities": {"tools": true, "resources": null}});
        let caps = CapabilitySet::from_initialize(&result);
        assert!(!caps.tools);
        assert!(!caps.resources);
    }

    #[test]
    fn test_advertised_subset() {
        let caps = CapabilitySet {
            tools: true,
            resources: false,
            prompts: true,
        };
        let advertised = caps.advertised();
        assert!(advertised["tools"].is_object());
        assert!(advertised.get("resources").is_none());
        assert!(advertised["prompts"].is_object());
    }

    #[tokio::test]
    async fn test_start_failure_on_missing_command() {
        let config = ServerConfig::new("mcpgate-no-such-binary-42");
        let result =
            BackendConnection::start("ghost", &config, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
