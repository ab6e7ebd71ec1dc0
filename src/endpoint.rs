//! Forwarding endpoint: the caller-facing protocol surface of one session.
//!
//! Every handler is pure pass-through: params go to the backend verbatim and
//! the result (or the backend's own error) comes back verbatim. Handlers are
//! registered per capability, so a category the backend never advertised is
//! answered with "method not found" rather than forwarded.

use crate::backend::CapabilitySet;
use crate::rpc::{self, RpcClient, RpcError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Operations the gateway can register handlers for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Initialize,
    Ping,
    ListTools,
    CallTool,
    ListResources,
    ReadResource,
    ListResourceTemplates,
    ListPrompts,
    GetPrompt,
}

/// Build the dispatch table once from the negotiated capability set
fn build_dispatch(caps: CapabilitySet) -> HashMap<&'static str, Operation> {
    let mut table = HashMap::new();
    table.insert("initialize", Operation::Initialize);
    table.insert("ping", Operation::Ping);
    if caps.tools {
        table.insert("tools/list", Operation::ListTools);
        table.insert("tools/call", Operation::CallTool);
    }
    if caps.resources {
        table.insert("resources/list", Operation::ListResources);
        table.insert("resources/read", Operation::ReadResource);
        table.insert("resources/templates/list", Operation::ListResourceTemplates);
    }
    if caps.prompts {
        table.insert("prompts/list", Operation::ListPrompts);
        table.insert("prompts/get", Operation::GetPrompt);
    }
    table
}

/// Relays one session's calls onto its backend's shared client link
pub struct ForwardingEndpoint {
    server_name: String,
    capabilities: CapabilitySet,
    client: Arc<RpcClient>,
    dispatch: HashMap<&'static str, Operation>,
}

impl ForwardingEndpoint {
    pub(crate) fn new(
        server_name: &str,
        capabilities: CapabilitySet,
        client: Arc<RpcClient>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            capabilities,
            client,
            dispatch: build_dispatch(capabilities),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the underlying channel is still usable
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Handle one inbound JSON-RPC message.
    ///
    /// Returns the response frame for requests and `None` for notifications.
    /// Transport-level failures bubble up so the caller can evict the session;
    /// the backend's own errors are embedded in the returned frame untouched.
    pub async fn handle(&self, message: Value) -> Result<Option<Value>, RpcError> {
        let method = match message.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => {
                return Ok(message
                    .get("id")
                    .map(|id| rpc::error_frame(id, rpc::INVALID_REQUEST, "Invalid Request")));
            }
        };

        let Some(id) = message.get("id").cloned() else {
            // Notifications get no response. The backend completed its own
            // handshake at startup, so `initialized` stops here.
            if method != "notifications/initialized" {
                debug!(server = %self.server_name, method = %method, "Dropping caller notification");
            }
            return Ok(None);
        };

        let Some(operation) = self.dispatch.get(method.as_str()).copied() else {
            debug!(server = %self.server_name, method = %method, "Method not registered for this backend");
            return Ok(Some(rpc::error_frame(
                &id,
                rpc::METHOD_NOT_FOUND,
                &format!("Method not found: {method}"),
            )));
        };

        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let forwarded = match operation {
            Operation::Initialize => {
                // Answered locally: the backend was initialized at startup
                return Ok(Some(rpc::response_frame(
                    &id,
                    json!({
                        "protocolVersion": rpc::PROTOCOL_VERSION,
                        "capabilities": self.capabilities.advertised(),
                        "serverInfo": {
                            "name": format!("mcpgate/{}", self.server_name),
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )));
            }
            Operation::Ping => return Ok(Some(rpc::response_frame(&id, json!({})))),
            Operation::ListTools => self.client.list_tools(params).await,
            Operation::CallTool => self.client.call_tool(params).await,
            Operation::ListResources => self.client.list_resources(params).await,
            Operation::ReadResource => self.client.read_resource(params).await,
            Operation::ListResourceTemplates => {
                self.client.list_resource_templates(params).await
            }
            Operation::ListPrompts => self.client.list_prompts(params).await,
            Operation::GetPrompt => self.client.get_prompt(params).await,
        };

        match forwarded {
            Ok(result) => Ok(Some(rpc::response_frame(&id, result))),
            Err(RpcError::Backend(error)) => Ok(Some(json!({
                "jsonrpc": rpc::JSONRPC_VERSION,
                "id": id,
                "error": error,
            }))),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::connected_client;

    async fn endpoint_with_caps(caps: CapabilitySet) -> ForwardingEndpoint {
        let client = connected_client(caps.advertised()).await;
        ForwardingEndpoint::new("echo", caps, client)
    }

    fn tools_only() -> CapabilitySet {
        CapabilitySet {
            tools: true,
            resources: false,
            prompts: false,
        }
    }

    #[tokio::test]
    async fn test_initialize_answered_locally() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["id"], 1);
        let result = &response["result"];
        assert_eq!(result["protocolVersion"], rpc::PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"].get("resources").is_none());
        assert_eq!(result["serverInfo"]["name"], "mcpgate/echo");
    }

    #[tokio::test]
    async fn test_ping_answered_locally() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": "p1", "method": "ping"}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["id"], "p1");
        assert!(response["result"].is_object());
    }

    #[tokio::test]
    async fn test_registered_method_is_pure_pass_through() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 42,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"message": "hi"}},
            }))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["id"], 42);
        assert_eq!(response["result"]["echo"]["method"], "tools/call");
        assert_eq!(response["result"]["echo"]["params"]["arguments"]["message"], "hi");
    }

    #[tokio::test]
    async fn test_missing_capability_yields_method_not_found() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}))
            .await
            .unwrap()
            .unwrap();

        // An error, never an empty success
        assert!(response.get("result").is_none());
        assert_eq!(response["error"]["code"], rpc::METHOD_NOT_FOUND);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("resources/list"));
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": 6, "method": "bogus/method"}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["error"]["code"], rpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backend_error_passes_through_verbatim() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "tools/call",
                "params": {"name": "fail"},
            }))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["id"], 9);
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["message"], "tool failed");
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let initialized = endpoint
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();
        assert!(initialized.is_none());

        let other = endpoint
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/cancelled"}))
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_message_without_method() {
        let endpoint = endpoint_with_caps(tools_only()).await;

        let response = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": 3}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["error"]["code"], rpc::INVALID_REQUEST);

        let nothing = endpoint.handle(json!({"jsonrpc": "2.0"})).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_bubbles_up() {
        let client = connected_client(json!({"tools": {}})).await;
        let endpoint = ForwardingEndpoint::new("echo", tools_only(), Arc::clone(&client));

        client.close().await;
        assert!(endpoint.is_closed());

        let err = endpoint
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }
}
