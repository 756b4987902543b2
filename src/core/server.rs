//! Managed server lifecycle.
//!
//! One `ManagedServer` wraps one backend, whatever its transport. It owns
//! the transport exclusively; a restart always tears the old transport down
//! before a new one exists. The composer drives transitions and is the only
//! caller that touches the registry on them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{ServerSpec, TranslatorKind};
use crate::core::capability::{CapabilityKind, DiscoveredCapabilities};
use crate::core::protocol::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, PROTOCOL_VERSION,
};
use crate::core::request_id::RequestIdGenerator;
use crate::transport::Transport;
use crate::utils::errors::{ComposeError, ComposeResult};

/// Lifecycle states of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
            ServerState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Point-in-time view of a server for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub kind: String,
    pub state: ServerState,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_exit_reason: Option<String>,
}

/// Runtime wrapper around one backend.
pub struct ManagedServer {
    pub spec: ServerSpec,
    state: parking_lot::RwLock<ServerState>,
    transport: tokio::sync::RwLock<Option<Arc<dyn Transport>>>,
    started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    restart_count: AtomicU32,
    last_exit_reason: parking_lot::Mutex<Option<String>>,
    id_gen: RequestIdGenerator,
    /// Bumped on every start so events from a previous transport's pump
    /// cannot affect the current incarnation.
    epoch: AtomicU64,
}

impl ManagedServer {
    pub fn new(spec: ServerSpec) -> Self {
        let id_gen = RequestIdGenerator::with_prefix(format!("cmp-{}", spec.name));
        Self {
            spec,
            state: parking_lot::RwLock::new(ServerState::Stopped),
            transport: tokio::sync::RwLock::new(None),
            started_at: parking_lot::Mutex::new(None),
            restart_count: AtomicU32::new(0),
            last_exit_reason: parking_lot::Mutex::new(None),
            id_gen,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn increment_restarts(&self) -> u32 {
        self.restart_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_restarts(&self) {
        self.restart_count.store(0, Ordering::SeqCst);
    }

    pub fn last_exit_reason(&self) -> Option<String> {
        self.last_exit_reason.lock().clone()
    }

    pub fn next_request_id(&self) -> RequestId {
        self.id_gen.next_id()
    }

    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().await.clone()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.spec.name.clone(),
            kind: self.spec.kind.to_string(),
            state: self.state(),
            started_at: *self.started_at.lock(),
            restart_count: self.restart_count(),
            last_exit_reason: self.last_exit_reason(),
        }
    }

    /// `Stopped|Crashed -> Starting`. Returns the new epoch.
    pub fn begin_start(&self) -> ComposeResult<u64> {
        let mut state = self.state.write();
        match *state {
            ServerState::Stopped | ServerState::Crashed => {
                *state = ServerState::Starting;
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(server = self.id(), epoch, "starting");
                Ok(epoch)
            }
            other => Err(ComposeError::InvalidRequest(format!(
                "server '{}' cannot start from state '{}'",
                self.id(),
                other
            ))),
        }
    }

    /// Attach the freshly created transport. Only valid while `Starting`.
    pub async fn install_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport);
    }

    /// `Starting -> Running`.
    pub fn mark_running(&self) {
        *self.state.write() = ServerState::Running;
        *self.started_at.lock() = Some(Utc::now());
        info!(server = self.id(), "running");
    }

    /// Fold any failure into `Crashed`, recording why. Uniform for write
    /// timeouts, malformed frames, handshake failures, and process exits.
    pub async fn mark_crashed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.state.write();
            if matches!(*state, ServerState::Stopping | ServerState::Stopped) {
                return;
            }
            *state = ServerState::Crashed;
        }
        warn!(server = self.id(), reason = %reason, "crashed");
        *self.last_exit_reason.lock() = Some(reason);
        *self.started_at.lock() = None;
        self.teardown_transport().await;
    }

    /// `Running -> Stopping`.
    pub fn begin_stop(&self) -> ComposeResult<()> {
        let mut state = self.state.write();
        match *state {
            ServerState::Running => {
                *state = ServerState::Stopping;
                Ok(())
            }
            other => Err(ComposeError::InvalidRequest(format!(
                "server '{}' cannot stop from state '{}'",
                self.id(),
                other
            ))),
        }
    }

    /// `Stopping -> Stopped`: graceful teardown, hard-kill once the grace
    /// period elapses (the transport's close handles escalation).
    pub async fn finish_stop(&self, grace: Duration) {
        if let Some(transport) = self.transport().await {
            match tokio::time::timeout(grace, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(server = self.id(), "error closing transport: {}", e),
                Err(_) => warn!(server = self.id(), "grace period elapsed closing transport"),
            }
        }
        *self.transport.write().await = None;
        *self.state.write() = ServerState::Stopped;
        *self.started_at.lock() = None;
        *self.last_exit_reason.lock() = Some("stopped".to_string());
        info!(server = self.id(), "stopped");
    }

    /// `Crashed -> Stopped`, once the restart policy declines to act.
    pub fn settle_stopped(&self) {
        let mut state = self.state.write();
        if *state == ServerState::Crashed {
            *state = ServerState::Stopped;
        }
    }

    async fn teardown_transport(&self) {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(server = self.id(), "transport close after crash: {}", e);
            }
        }
    }

    /// Run the initialize handshake and capability discovery over the
    /// installed transport. Called before the read pump exists, so frames
    /// are consumed directly here.
    pub async fn handshake(&self, timeout: Duration) -> ComposeResult<DiscoveredCapabilities> {
        let transport = self
            .transport()
            .await
            .ok_or_else(|| ComposeError::StartupFailure("no transport installed".to_string()))?;

        let init = JsonRpcRequest::with_id(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-compose",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            self.next_request_id(),
        );

        let response = self.roundtrip(&transport, init, timeout).await?;
        if let Some(error) = response.error {
            return Err(ComposeError::StartupFailure(format!(
                "initialize rejected: {}",
                error.message
            )));
        }

        transport
            .send(JsonRpcMessage::Request(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            )))
            .await?;

        let mut discovered = DiscoveredCapabilities::default();
        for kind in CapabilityKind::ALL {
            let request =
                JsonRpcRequest::with_id(kind.list_method(), None, self.next_request_id());
            let response = self.roundtrip(&transport, request, timeout).await?;

            match (response.result, response.error) {
                (Some(result), _) => discovered.absorb_list_result(kind, &result),
                (None, Some(error)) => {
                    // Backends without this capability answer method-not-found.
                    debug!(
                        server = self.id(),
                        method = kind.list_method(),
                        "discovery skipped: {}",
                        error.message
                    );
                }
                (None, None) => {}
            }
        }

        info!(
            server = self.id(),
            tools = discovered.tools.len(),
            resources = discovered.resources.len(),
            prompts = discovered.prompts.len(),
            "discovery complete"
        );
        Ok(discovered)
    }

    async fn roundtrip(
        &self,
        transport: &Arc<dyn Transport>,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> ComposeResult<JsonRpcResponse> {
        let expected = request
            .id
            .clone()
            .ok_or_else(|| ComposeError::InvalidRequest("request without id".to_string()))?;

        transport.send(JsonRpcMessage::Request(request)).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(ComposeError::Timeout(timeout.as_millis() as u64))?;

            match tokio::time::timeout(remaining, transport.receive()).await {
                Ok(Some(JsonRpcMessage::Response(response)))
                    if response.id.as_ref() == Some(&expected) =>
                {
                    return Ok(response);
                }
                Ok(Some(frame)) => {
                    debug!(server = self.id(), "unexpected frame during handshake: {:?}", frame);
                }
                Ok(None) => {
                    return Err(ComposeError::TransportError(
                        "transport closed during handshake".to_string(),
                    ));
                }
                Err(_) => return Err(ComposeError::Timeout(timeout.as_millis() as u64)),
            }
        }
    }
}

/// Status shape shared with translators so both list uniformly.
pub fn translator_status(name: &str, kind: TranslatorKind, state: ServerState) -> ServerStatus {
    ServerStatus {
        name: name.to_string(),
        kind: format!("translator:{}", kind),
        state,
        started_at: None,
        restart_count: 0,
        last_exit_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServerSpec {
        ServerSpec {
            name: name.into(),
            command: Some("true".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let server = ManagedServer::new(spec("calc"));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.restart_count(), 0);
        assert!(server.last_exit_reason().is_none());
    }

    #[test]
    fn test_begin_start_only_from_stopped_or_crashed() {
        let server = ManagedServer::new(spec("calc"));

        let first = server.begin_start().unwrap();
        assert_eq!(server.state(), ServerState::Starting);
        assert!(server.begin_start().is_err());

        server.mark_running();
        assert!(server.begin_start().is_err());

        tokio_test::block_on(server.mark_crashed("boom"));
        let second = server.begin_start().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_crash_records_reason_and_clears_transport() {
        let server = ManagedServer::new(spec("calc"));
        server.begin_start().unwrap();
        server.mark_running();

        server.mark_crashed("process exited unexpectedly").await;
        assert_eq!(server.state(), ServerState::Crashed);
        assert_eq!(
            server.last_exit_reason().as_deref(),
            Some("process exited unexpectedly")
        );
        assert!(server.transport().await.is_none());
    }

    #[tokio::test]
    async fn test_crash_during_stop_is_ignored() {
        let server = ManagedServer::new(spec("calc"));
        server.begin_start().unwrap();
        server.mark_running();
        server.begin_stop().unwrap();

        // The pump noticing the closing transport must not override the
        // explicit stop.
        server.mark_crashed("transport closed").await;
        assert_eq!(server.state(), ServerState::Stopping);

        server.finish_stop(Duration::from_millis(100)).await;
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_settle_stopped_only_from_crashed() {
        let server = ManagedServer::new(spec("calc"));
        server.settle_stopped();
        assert_eq!(server.state(), ServerState::Stopped);

        server.begin_start().unwrap();
        server.settle_stopped();
        assert_eq!(server.state(), ServerState::Starting);
    }
}
