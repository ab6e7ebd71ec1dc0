//! Minimal stdio MCP server used by the integration tests.
//!
//! Advertises the capability categories named in the `MCP_ECHO_CAPS` env var
//! (comma-separated, default "tools,prompts") and echoes tool calls back.

use mcpgate::rpc::{error_frame, response_frame, METHOD_NOT_FOUND, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{BufRead, Write};

fn main() {
    let caps = std::env::var("MCP_ECHO_CAPS").unwrap_or_else(|_| "tools,prompts".to_string());
    let tools = caps.contains("tools");
    let resources = caps.contains("resources");
    let prompts = caps.contains("prompts");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id") else {
            continue; // notifications need no reply
        };

        let reply = match method {
            "initialize" => {
                let mut advertised = serde_json::Map::new();
                if tools {
                    advertised.insert("tools".to_string(), json!({}));
                }
                if resources {
                    advertised.insert("resources".to_string(), json!({}));
                }
                if prompts {
                    advertised.insert("prompts".to_string(), json!({}));
                }
                response_frame(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": Value::Object(advertised),
                        "serverInfo": {"name": "mcp-echo", "version": env!("CARGO_PKG_VERSION")},
                    }),
                )
            }
            "ping" => response_frame(id, json!({})),
            "tools/list" if tools => response_frame(
                id,
                json!({
                    "tools": [{
                        "name": "echo",
                        "description": "Echo the provided arguments back",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"message": {"type": "string"}},
                        },
                    }],
                }),
            ),
            "tools/call" if tools => {
                let arguments = message["params"]["arguments"].clone();
                response_frame(
                    id,
                    json!({
                        "content": [{"type": "text", "text": arguments.to_string()}],
                    }),
                )
            }
            "resources/list" if resources => response_frame(id, json!({"resources": []})),
            "resources/templates/list" if resources => {
                response_frame(id, json!({"resourceTemplates": []}))
            }
            "resources/read" if resources => response_frame(id, json!({"contents": []})),
            "prompts/list" if prompts => response_frame(
                id,
                json!({
                    "prompts": [{"name": "greet", "description": "A canned greeting"}],
                }),
            ),
            "prompts/get" if prompts => response_frame(
                id,
                json!({
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": "hello"},
                    }],
                }),
            ),
            other => error_frame(id, METHOD_NOT_FOUND, &format!("Method not found: {other}")),
        };

        let mut out = stdout.lock();
        if writeln!(out, "{}", reply).is_err() {
            break;
        }
        let _ = out.flush();
    }
}
