//! The composer: owns every managed server and translator, the merged
//! capability registry, and the in-flight request table.
//!
//! Each backend transport gets its own read pump so a stalled server never
//! blocks another; the composer coordinates through channels and the
//! registry is the single synchronized structure. Request correlation is
//! held here, never in transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ComposeConfig, ComposerSettings, RestartPolicy, ServerSpec, TranslatorSpec};
use crate::core::capability::{CapabilityDescriptor, CapabilityKind};
use crate::core::protocol::{
    Implementation, InitializeResult, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
    PromptCapabilities, RequestId, ResourceCapabilities, ServerCapabilities, ToolCapabilities,
    PROTOCOL_VERSION,
};
use crate::core::registry::{CapabilityRegistry, ConflictRecord};
use crate::core::server::{translator_status, ManagedServer, ServerState, ServerStatus};
use crate::transport::{Transport, TransportFactory};
use crate::translator::{self, Translator};
use crate::utils::errors::{ComposeError, ComposeResult};

/// Backend responses are matched to callers by (owning server, backend id).
type PendingKey = (String, RequestId);

/// One pending call, owned by the composer until its response, error, or
/// deadline arrives.
struct InFlightRequest {
    correlation_id: Uuid,
    response_tx: oneshot::Sender<JsonRpcResponse>,
}

enum LifecycleEvent {
    TransportClosed {
        server_id: String,
        epoch: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositionSummary {
    pub name: String,
    pub conflict_resolution: String,
    pub total_tools: usize,
    pub total_resources: usize,
    pub total_prompts: usize,
    pub conflicts_resolved: Vec<ConflictRecord>,
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct Composer {
    settings: ComposerSettings,
    registry: CapabilityRegistry,
    servers: DashMap<String, Arc<ManagedServer>>,
    translators: DashMap<String, Arc<dyn Translator>>,
    factory: Arc<dyn TransportFactory>,
    in_flight: Arc<DashMap<PendingKey, InFlightRequest>>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    shutting_down: AtomicBool,
    /// Handle to ourselves for background tasks; never keeps the composer
    /// alive on its own.
    weak_self: Weak<Composer>,
}

impl Composer {
    /// Construct a composer. No ambient singletons: tests build as many
    /// independent composers as they need.
    pub fn new(settings: ComposerSettings, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let composer = Arc::new_cyclic(|weak_self| Self {
            registry: CapabilityRegistry::new(settings.conflict_resolution),
            settings,
            servers: DashMap::new(),
            translators: DashMap::new(),
            factory,
            in_flight: Arc::new(DashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutting_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });
        composer.spawn_supervisor();
        composer
    }

    pub fn settings(&self) -> &ComposerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.invoke_timeout_ms)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.handshake_timeout_ms)
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.settings.stop_grace_ms)
    }

    // ------------------------------------------------------------------
    // Registration and bootstrap
    // ------------------------------------------------------------------

    /// Register a server without starting it.
    pub fn add_server(&self, spec: ServerSpec) -> ComposeResult<Arc<ManagedServer>> {
        spec.validate_kind()?;
        if self.servers.contains_key(&spec.name) || self.translators.contains_key(&spec.name) {
            return Err(ComposeError::ConfigError(format!(
                "duplicate server name: '{}'",
                spec.name
            )));
        }
        let server = Arc::new(ManagedServer::new(spec));
        self.servers.insert(server.id().to_string(), server.clone());
        Ok(server)
    }

    pub fn add_translator(&self, spec: TranslatorSpec) -> ComposeResult<Arc<dyn Translator>> {
        if self.servers.contains_key(&spec.name) || self.translators.contains_key(&spec.name) {
            return Err(ComposeError::ConfigError(format!(
                "duplicate name: '{}'",
                spec.name
            )));
        }
        let bridge = translator::build(&spec)?;
        self.translators.insert(spec.name.clone(), bridge.clone());
        Ok(bridge)
    }

    /// Register and start everything a config declares. Startup failures
    /// are collected, not fatal: one broken backend never takes down the
    /// rest of the composition.
    pub async fn bootstrap(&self, config: &ComposeConfig) -> Vec<(String, ComposeError)> {
        let mut failures = Vec::new();

        for spec in &config.servers {
            if !spec.enabled {
                info!(server = %spec.name, "skipping disabled server");
                continue;
            }
            match self.add_server(spec.clone()) {
                Ok(server) => {
                    if let Err(e) = self.start_internal(server).await {
                        failures.push((spec.name.clone(), e));
                    }
                }
                Err(e) => failures.push((spec.name.clone(), e)),
            }
        }

        for spec in &config.translators {
            match self.add_translator(spec.clone()) {
                Ok(bridge) => {
                    if let Err(e) = bridge.start().await {
                        failures.push((spec.name.clone(), e));
                    }
                }
                Err(e) => failures.push((spec.name.clone(), e)),
            }
        }

        info!(
            servers = self.servers.len(),
            translators = self.translators.len(),
            capabilities = self.registry.len(),
            failures = failures.len(),
            "composition bootstrap complete"
        );
        failures
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    pub fn list_servers(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> =
            self.servers.iter().map(|entry| entry.status()).collect();
        statuses.extend(
            self.translators
                .iter()
                .map(|entry| translator_status(entry.name(), entry.kind(), entry.state())),
        );
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_server(&self, id: &str) -> Option<ServerStatus> {
        if let Some(server) = self.servers.get(id) {
            return Some(server.status());
        }
        self.translators
            .get(id)
            .map(|t| translator_status(t.name(), t.kind(), t.state()))
    }

    /// Start a server by id. Idempotent: starting a running server reports
    /// its status unchanged. An explicit start resets the restart budget.
    pub async fn start(&self, id: &str) -> ComposeResult<ServerStatus> {
        if let Some(bridge) = self.get_translator(id) {
            bridge.start().await?;
            return Ok(translator_status(bridge.name(), bridge.kind(), bridge.state()));
        }

        let server = self.require_server(id)?;
        match server.state() {
            ServerState::Running => {
                debug!(server = id, "start requested but already running");
                return Ok(server.status());
            }
            ServerState::Starting | ServerState::Stopping => {
                return Err(ComposeError::InvalidRequest(format!(
                    "server '{}' is busy ({})",
                    id,
                    server.state()
                )));
            }
            ServerState::Stopped | ServerState::Crashed => {}
        }
        server.reset_restarts();
        self.start_internal(server.clone()).await?;
        Ok(server.status())
    }

    /// Stop a server by id. Idempotent for already-stopped servers.
    pub async fn stop(&self, id: &str) -> ComposeResult<ServerStatus> {
        if let Some(bridge) = self.get_translator(id) {
            bridge.stop().await?;
            return Ok(translator_status(bridge.name(), bridge.kind(), bridge.state()));
        }

        let server = self.require_server(id)?;
        match server.state() {
            ServerState::Stopped => {
                debug!(server = id, "stop requested but already stopped");
                return Ok(server.status());
            }
            ServerState::Crashed => {
                server.settle_stopped();
                return Ok(server.status());
            }
            ServerState::Starting | ServerState::Stopping => {
                return Err(ComposeError::InvalidRequest(format!(
                    "server '{}' is busy ({})",
                    id,
                    server.state()
                )));
            }
            ServerState::Running => {}
        }

        server.begin_stop()?;
        // Leaving Running: this server's contributions and pending calls go.
        self.registry.remove_server(id);
        self.abort_in_flight(id);
        server.finish_stop(self.stop_grace()).await;
        Ok(server.status())
    }

    pub async fn restart(&self, id: &str) -> ComposeResult<ServerStatus> {
        if self.servers.contains_key(id) || self.translators.contains_key(id) {
            match self.get_server(id).map(|s| s.state) {
                Some(ServerState::Running) => {
                    self.stop(id).await?;
                }
                Some(ServerState::Crashed) => {
                    if let Some(server) = self.servers.get(id) {
                        server.settle_stopped();
                    }
                }
                _ => {}
            }
            return self.start(id).await;
        }
        Err(ComposeError::NotFound(format!("unknown server: '{}'", id)))
    }

    /// Diff the running set against a new spec set. Removed servers stop
    /// and leave the registry; new ones start; changed ones restart with
    /// their new spec; unchanged ones are left running untouched.
    pub async fn reload(
        &self,
        servers: Vec<ServerSpec>,
        translators: Vec<TranslatorSpec>,
    ) -> ComposeResult<ReloadReport> {
        let mut report = ReloadReport::default();

        let desired: HashMap<String, ServerSpec> = servers
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| (s.name.clone(), s))
            .collect();
        let desired_translators: HashMap<String, TranslatorSpec> = translators
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        let current: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for id in current {
            if !desired.contains_key(&id) {
                info!(server = %id, "removed by reload");
                if let Err(e) = self.stop(&id).await {
                    warn!(server = %id, "error stopping removed server: {}", e);
                }
                self.servers.remove(&id);
                report.removed.push(id);
            }
        }

        for (id, spec) in desired {
            match self.servers.get(&id).map(|s| s.value().clone()) {
                None => {
                    info!(server = %id, "added by reload");
                    match self.add_server(spec) {
                        Ok(server) => {
                            if let Err(e) = self.start_internal(server).await {
                                warn!(server = %id, "added server failed to start: {}", e);
                            }
                        }
                        Err(e) => warn!(server = %id, "failed to add server: {}", e),
                    }
                    report.added.push(id);
                }
                Some(existing) if existing.spec == spec => {
                    report.unchanged.push(id);
                }
                Some(_) => {
                    info!(server = %id, "spec changed, restarting");
                    if let Err(e) = self.stop(&id).await {
                        warn!(server = %id, "error stopping changed server: {}", e);
                    }
                    self.servers.remove(&id);
                    match self.add_server(spec) {
                        Ok(server) => {
                            if let Err(e) = self.start_internal(server).await {
                                warn!(server = %id, "changed server failed to start: {}", e);
                            }
                        }
                        Err(e) => warn!(server = %id, "failed to re-add server: {}", e),
                    }
                    report.changed.push(id);
                }
            }
        }

        let current_translators: Vec<String> =
            self.translators.iter().map(|e| e.key().clone()).collect();
        for id in current_translators {
            if !desired_translators.contains_key(&id) {
                if let Some((_, bridge)) = self.translators.remove(&id) {
                    let _ = bridge.stop().await;
                }
                report.removed.push(id);
            }
        }
        for (id, spec) in desired_translators {
            if !self.translators.contains_key(&id) {
                match self.add_translator(spec) {
                    Ok(bridge) => {
                        if let Err(e) = bridge.start().await {
                            warn!(translator = %id, "failed to start: {}", e);
                        }
                        report.added.push(id);
                    }
                    Err(e) => warn!(translator = %id, "failed to add: {}", e),
                }
            }
        }

        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            "reload complete"
        );
        Ok(report)
    }

    /// Stop everything: servers first, then bridges.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return;
        }
        info!("shutting down composition");

        let ids: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(server = %id, "error during shutdown: {}", e);
            }
        }
        let bridges: Vec<Arc<dyn Translator>> =
            self.translators.iter().map(|e| e.value().clone()).collect();
        for bridge in bridges {
            if let Err(e) = bridge.stop().await {
                warn!(translator = bridge.name(), "error during shutdown: {}", e);
            }
        }
        info!("composition stopped");
    }

    // ------------------------------------------------------------------
    // Capability surface
    // ------------------------------------------------------------------

    pub fn list_capabilities(
        &self,
        kind: Option<CapabilityKind>,
        filter: Option<&str>,
    ) -> Vec<CapabilityDescriptor> {
        self.registry.list(kind, filter)
    }

    pub fn summary(&self) -> CompositionSummary {
        CompositionSummary {
            name: self.settings.name.clone(),
            conflict_resolution: format!("{:?}", self.registry.policy()).to_lowercase(),
            total_tools: self.registry.list(Some(CapabilityKind::Tool), None).len(),
            total_resources: self
                .registry
                .list(Some(CapabilityKind::Resource), None)
                .len(),
            total_prompts: self.registry.list(Some(CapabilityKind::Prompt), None).len(),
            conflicts_resolved: self.registry.conflicts_resolved(),
            servers: self.list_servers(),
        }
    }

    /// Invoke a capability by its public name.
    ///
    /// Resolution happens in the registry; the call is forwarded to the
    /// owning server under the backend's own name, and the response is
    /// matched by backend id through the in-flight table. A deadline expiry
    /// abandons the call; the backend's eventual late response is dropped.
    pub async fn invoke(
        &self,
        kind: CapabilityKind,
        qualified_name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> ComposeResult<JsonRpcResponse> {
        let descriptor = self
            .registry
            .resolve(kind, qualified_name)
            .ok_or_else(|| ComposeError::NotFound(format!("{} '{}'", kind, qualified_name)))?;

        let server = self
            .servers
            .get(&descriptor.owning_server_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                ComposeError::ServerUnavailable(format!(
                    "server '{}' is gone",
                    descriptor.owning_server_id
                ))
            })?;

        if server.state() != ServerState::Running {
            return Err(ComposeError::ServerUnavailable(format!(
                "server '{}' is {}",
                server.id(),
                server.state()
            )));
        }

        let (method, params) = match kind {
            CapabilityKind::Tool => (
                "tools/call",
                json!({
                    "name": descriptor.original_name,
                    "arguments": arguments.unwrap_or_else(|| json!({})),
                }),
            ),
            CapabilityKind::Resource => (
                "resources/read",
                json!({ "uri": descriptor.original_name }),
            ),
            CapabilityKind::Prompt => (
                "prompts/get",
                json!({
                    "name": descriptor.original_name,
                    "arguments": arguments.unwrap_or_else(|| json!({})),
                }),
            ),
        };

        self.request_to_server(
            &server,
            method,
            Some(params),
            timeout.unwrap_or_else(|| self.invoke_timeout()),
        )
        .await
    }

    /// Forward one request to a running server and await the matching
    /// response by id.
    async fn request_to_server(
        &self,
        server: &Arc<ManagedServer>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ComposeResult<JsonRpcResponse> {
        let transport = server.transport().await.ok_or_else(|| {
            ComposeError::ServerUnavailable(format!("server '{}' has no transport", server.id()))
        })?;

        let backend_id = server.next_request_id();
        let key: PendingKey = (server.id().to_string(), backend_id.clone());
        let correlation_id = Uuid::new_v4();
        let (response_tx, response_rx) = oneshot::channel();

        self.in_flight.insert(
            key.clone(),
            InFlightRequest {
                correlation_id,
                response_tx,
            },
        );
        debug!(
            server = server.id(),
            %correlation_id,
            method,
            "forwarding request"
        );

        let request = JsonRpcRequest::with_id(method, params, backend_id);
        if let Err(e) = transport.send(JsonRpcMessage::Request(request)).await {
            self.in_flight.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            // The in-flight entry was dropped: the server stopped or crashed.
            Ok(Err(_)) => Err(ComposeError::ServerUnavailable(format!(
                "server '{}' went away before responding",
                server.id()
            ))),
            Err(_) => {
                self.in_flight.remove(&key);
                debug!(server = server.id(), %correlation_id, "invocation timed out");
                Err(ComposeError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    // ------------------------------------------------------------------
    // Client-facing protocol dispatch
    // ------------------------------------------------------------------

    /// Serve one client request against the composed namespace. Returns
    /// `None` for notifications. The client's own id is echoed back;
    /// backend correlation stays internal.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = match request.id.clone() {
            Some(id) => id,
            None => {
                debug!(method = %request.method, "client notification");
                return None;
            }
        };

        let response = match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolCapabilities { list_changed: true }),
                        resources: Some(ResourceCapabilities {
                            subscribe: false,
                            list_changed: true,
                        }),
                        prompts: Some(PromptCapabilities { list_changed: true }),
                    },
                    server_info: Implementation {
                        name: self.settings.name.clone(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                JsonRpcResponse::success(
                    id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                )
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.list_response(id, CapabilityKind::Tool),
            "resources/list" => self.list_response(id, CapabilityKind::Resource),
            "prompts/list" => self.list_response(id, CapabilityKind::Prompt),
            "tools/call" => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|n| n.as_str())
                    .map(String::from);
                let arguments = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned();
                match name {
                    Some(name) => {
                        self.proxy_invoke(id, CapabilityKind::Tool, &name, arguments)
                            .await
                    }
                    None => JsonRpcResponse::error(Some(id), -32602, "missing tool name"),
                }
            }
            "resources/read" => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(|u| u.as_str())
                    .map(String::from);
                match uri {
                    Some(uri) => {
                        self.proxy_invoke(id, CapabilityKind::Resource, &uri, None)
                            .await
                    }
                    None => JsonRpcResponse::error(Some(id), -32602, "missing resource uri"),
                }
            }
            "prompts/get" => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|n| n.as_str())
                    .map(String::from);
                let arguments = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned();
                match name {
                    Some(name) => {
                        self.proxy_invoke(id, CapabilityKind::Prompt, &name, arguments)
                            .await
                    }
                    None => JsonRpcResponse::error(Some(id), -32602, "missing prompt name"),
                }
            }
            other => {
                JsonRpcResponse::error(Some(id), -32601, format!("method not found: {}", other))
            }
        };
        Some(response)
    }

    fn list_response(&self, id: RequestId, kind: CapabilityKind) -> JsonRpcResponse {
        let entries: Vec<Value> = self
            .registry
            .list(Some(kind), None)
            .iter()
            .map(CapabilityDescriptor::public_schema)
            .collect();
        JsonRpcResponse::success(id, json!({ (kind.list_key()): entries }))
    }

    async fn proxy_invoke(
        &self,
        client_id: RequestId,
        kind: CapabilityKind,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> JsonRpcResponse {
        match self.invoke(kind, qualified_name, arguments, None).await {
            Ok(backend) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: Some(client_id),
                result: backend.result,
                error: backend.error,
            },
            Err(e) => JsonRpcResponse::error(Some(client_id), e.jsonrpc_code(), e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Internals: startup, pumps, crash supervision
    // ------------------------------------------------------------------

    fn require_server(&self, id: &str) -> ComposeResult<Arc<ManagedServer>> {
        self.servers
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| ComposeError::NotFound(format!("unknown server: '{}'", id)))
    }

    fn get_translator(&self, id: &str) -> Option<Arc<dyn Translator>> {
        self.translators.get(id).map(|t| t.value().clone())
    }

    async fn start_internal(&self, server: Arc<ManagedServer>) -> ComposeResult<()> {
        let epoch = server.begin_start()?;
        let id = server.id().to_string();

        let transport: Arc<dyn Transport> = match self.factory.create(&server.spec).await {
            Ok(transport) => Arc::from(transport),
            Err(e) => {
                let reason = format!("failed to create transport: {}", e);
                server.mark_crashed(reason.clone()).await;
                self.schedule_restart(server.clone());
                return Err(ComposeError::StartupFailure(reason));
            }
        };
        server.install_transport(transport.clone()).await;

        let discovered = match server.handshake(self.handshake_timeout()).await {
            Ok(discovered) => discovered,
            Err(e) => {
                let reason = format!("handshake failed: {}", e);
                server.mark_crashed(reason.clone()).await;
                self.schedule_restart(server.clone());
                return Err(ComposeError::StartupFailure(reason));
            }
        };

        match self.registry.register_server(&id, &discovered) {
            Ok(report) => {
                debug!(
                    server = %id,
                    registered = report.registered,
                    dropped = report.dropped,
                    "capabilities registered"
                );
            }
            Err(e) => {
                // A name conflict under the `error` policy is deterministic;
                // retrying cannot succeed, so no restart is scheduled.
                server.mark_crashed(e.to_string()).await;
                return Err(e);
            }
        }

        server.mark_running();
        self.spawn_pump(server.clone(), transport, epoch);
        self.spawn_health_check(server, epoch);
        Ok(())
    }

    /// One read pump per backend: forwards responses into the in-flight
    /// table and reports the transport's death.
    fn spawn_pump(&self, server: Arc<ManagedServer>, transport: Arc<dyn Transport>, epoch: u64) {
        let in_flight = self.in_flight.clone();
        let events_tx = self.events_tx.clone();
        let server_id = server.id().to_string();

        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_millis(500));
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let reason;

            loop {
                tokio::select! {
                    message = transport.receive() => match message {
                        Some(JsonRpcMessage::Response(response)) => {
                            match response.id.clone() {
                                Some(id) => {
                                    let key = (server_id.clone(), id);
                                    if let Some((_, pending)) = in_flight.remove(&key) {
                                        debug!(
                                            server = %server_id,
                                            correlation_id = %pending.correlation_id,
                                            "response matched"
                                        );
                                        let _ = pending.response_tx.send(response);
                                    } else {
                                        // Late arrival after a timeout, or an id
                                        // this composer never issued.
                                        debug!(server = %server_id, "unmatched response discarded");
                                    }
                                }
                                None => debug!(server = %server_id, "response without id ignored"),
                            }
                        }
                        Some(JsonRpcMessage::Request(request)) => {
                            debug!(
                                server = %server_id,
                                method = %request.method,
                                "backend-initiated message ignored"
                            );
                        }
                        None => {
                            reason = "transport closed".to_string();
                            break;
                        }
                    },
                    _ = poll.tick() => {
                        if !transport.is_connected().await {
                            reason = "transport disconnected".to_string();
                            break;
                        }
                    }
                }
            }

            let _ = events_tx.send(LifecycleEvent::TransportClosed {
                server_id,
                epoch,
                reason,
            });
        });
    }

    fn spawn_health_check(&self, server: Arc<ManagedServer>, epoch: u64) {
        let Some(interval_ms) = server.spec.health_check_interval_ms else {
            return;
        };
        let weak = self.weak_self.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let interval = Duration::from_millis(interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                let Some(composer) = weak.upgrade() else { break };
                if server.epoch() != epoch || server.state() != ServerState::Running {
                    break;
                }

                let ping_timeout = interval.min(Duration::from_secs(10));
                match composer
                    .request_to_server(&server, "ping", None, ping_timeout)
                    .await
                {
                    Ok(_) => debug!(server = server.id(), "health check ok"),
                    Err(e) => {
                        warn!(server = server.id(), "health check failed: {}", e);
                        let _ = events_tx.send(LifecycleEvent::TransportClosed {
                            server_id: server.id().to_string(),
                            epoch,
                            reason: format!("health check failed: {}", e),
                        });
                        break;
                    }
                }
            }
        });
    }

    fn spawn_supervisor(&self) {
        let weak = self.weak_self.clone();
        let mut events_rx = self
            .events_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .expect("supervisor spawned once");

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(composer) = weak.upgrade() else { break };
                match event {
                    LifecycleEvent::TransportClosed {
                        server_id,
                        epoch,
                        reason,
                    } => {
                        composer
                            .handle_transport_closed(&server_id, epoch, reason)
                            .await;
                    }
                }
            }
            debug!("composer supervisor ended");
        });
    }

    async fn handle_transport_closed(&self, server_id: &str, epoch: u64, reason: String) {
        let Some(server) = self.servers.get(server_id).map(|s| s.value().clone()) else {
            return;
        };
        // Events from a previous incarnation's pump are stale.
        if server.epoch() != epoch {
            return;
        }
        match server.state() {
            // Graceful teardown or an already-handled crash.
            ServerState::Stopping | ServerState::Stopped | ServerState::Crashed => return,
            ServerState::Starting => return,
            ServerState::Running => {}
        }

        error!(server = %server_id, reason = %reason, "unexpected transport close");
        self.registry.remove_server(server_id);
        self.abort_in_flight(server_id);
        server.mark_crashed(reason).await;
        self.schedule_restart(server);
    }

    /// Drop every pending call owned by a server; their callers see the
    /// closed channel, not a hang.
    fn abort_in_flight(&self, server_id: &str) {
        self.in_flight.retain(|(owner, _), _| owner != server_id);
    }

    /// Apply the restart policy after a crash.
    fn schedule_restart(&self, server: Arc<ManagedServer>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if server.state() != ServerState::Crashed {
            return;
        }

        let spec = &server.spec;
        match spec.restart_policy {
            RestartPolicy::Never => {
                info!(server = server.id(), "restart policy is never; staying down");
                server.settle_stopped();
            }
            RestartPolicy::OnFailure | RestartPolicy::Always => {
                let attempts = server.restart_count();
                if attempts >= spec.max_restarts {
                    warn!(
                        server = server.id(),
                        attempts, "restart budget exhausted; staying down"
                    );
                    server.settle_stopped();
                    return;
                }
                let attempt = server.increment_restarts();
                let delay = Duration::from_millis(spec.restart_delay_ms);
                info!(
                    server = server.id(),
                    attempt,
                    max = spec.max_restarts,
                    delay_ms = spec.restart_delay_ms,
                    "scheduling restart"
                );

                let weak = self.weak_self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(composer) = weak.upgrade() else { return };
                    // An explicit stop or start in the meantime wins.
                    if server.state() != ServerState::Crashed {
                        return;
                    }
                    if let Err(e) = composer.start_internal(server.clone()).await {
                        warn!(server = server.id(), "restart attempt failed: {}", e);
                    }
                });
            }
        }
    }
}
