//! Shared test fixtures: in-process backends driven through the same
//! transport factory the composer uses in production.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_compose::config::{ComposerSettings, ServerKind, ServerSpec};
use mcp_compose::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use mcp_compose::core::server::ServerState;
use mcp_compose::core::Composer;
use mcp_compose::transport::{EmbeddedServer, StandardTransportFactory};
use mcp_compose::utils::errors::{ComposeError, ComposeResult};

/// An embedded backend advertising a fixed set of tools. Each tool call
/// echoes a canned result; `crash_on` makes a named tool (or any request
/// while poisoned) kill the backend mid-session.
pub struct ToolServer {
    name: String,
    tools: Vec<(String, String)>,
    call_delay: Option<Duration>,
    crash_on: Option<String>,
    poisoned: Arc<AtomicBool>,
}

impl ToolServer {
    pub fn new(name: &str, tools: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools
                .iter()
                .map(|(n, r)| (n.to_string(), r.to_string()))
                .collect(),
            call_delay: None,
            crash_on: None,
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn with_crash_on(mut self, tool: &str) -> Self {
        self.crash_on = Some(tool.to_string());
        self
    }

    /// Handle to flip the backend dead or alive from the test.
    pub fn poison_handle(&self) -> Arc<AtomicBool> {
        self.poisoned.clone()
    }
}

#[async_trait]
impl EmbeddedServer for ToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: JsonRpcRequest) -> ComposeResult<JsonRpcResponse> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(ComposeError::TransportError("backend poisoned".into()));
        }
        let id = request
            .id
            .clone()
            .ok_or_else(|| ComposeError::InvalidRequest("missing id".into()))?;

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.name, "version": "0.0.1"},
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|(name, _)| {
                        json!({
                            "name": name,
                            "description": format!("{} from {}", name, self.name),
                            "inputSchema": {"type": "object", "properties": {}},
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({"tools": tools}))
            }
            "resources/list" | "prompts/list" => {
                JsonRpcResponse::error(Some(id), -32601, "method not found")
            }
            "tools/call" => {
                let tool = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();

                if self.crash_on.as_deref() == Some(tool.as_str()) {
                    self.poisoned.store(true, Ordering::SeqCst);
                    return Err(ComposeError::TransportError("backend crashed".into()));
                }
                if let Some(delay) = self.call_delay {
                    tokio::time::sleep(delay).await;
                }

                match self.tools.iter().find(|(name, _)| *name == tool) {
                    Some((_, result)) => JsonRpcResponse::success(
                        id,
                        json!({"content": [{"type": "text", "text": result}]}),
                    ),
                    None => JsonRpcResponse::error(
                        Some(id),
                        -32602,
                        format!("unknown tool: {}", tool),
                    ),
                }
            }
            other => JsonRpcResponse::error(Some(id), -32601, format!("method not found: {}", other)),
        };
        Ok(response)
    }
}

pub fn embedded_spec(name: &str, module: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        kind: ServerKind::Embedded,
        module: Some(module.to_string()),
        ..Default::default()
    }
}

pub fn settings(conflict_resolution: mcp_compose::config::ConflictResolution) -> ComposerSettings {
    ComposerSettings {
        name: "test-composer".to_string(),
        conflict_resolution,
        invoke_timeout_ms: 2_000,
        handshake_timeout_ms: 2_000,
        stop_grace_ms: 500,
    }
}

/// Build a composer over the given embedded modules.
pub fn composer_with_modules(
    conflict_resolution: mcp_compose::config::ConflictResolution,
    modules: Vec<Arc<dyn EmbeddedServer>>,
) -> Arc<Composer> {
    let mut factory = StandardTransportFactory::new();
    for module in modules {
        factory.register_embedded(module);
    }
    Composer::new(settings(conflict_resolution), Arc::new(factory))
}

/// Poll a server until it reaches `target` or the deadline passes.
pub async fn wait_for_state(
    composer: &Arc<Composer>,
    id: &str,
    target: ServerState,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if composer.get_server(id).map(|s| s.state) == Some(target) {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
