//! In-process transport for embedded servers.
//!
//! No wire, no framing: `send` calls straight into the loaded module and
//! queues whatever it returns on the inbound channel, so the composer
//! treats embedded backends exactly like remote ones.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::core::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::traits::Transport;
use crate::utils::errors::{ComposeError, ComposeResult};

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// An in-process capability provider.
///
/// Implementations answer the same JSON-RPC methods a standalone MCP server
/// would (`initialize`, `tools/list`, `tools/call`, ...). An `Err` return
/// closes the transport, which the composer folds into a crash transition
/// like any other backend failure.
#[async_trait]
pub trait EmbeddedServer: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, request: JsonRpcRequest) -> ComposeResult<JsonRpcResponse>;

    /// Notifications are fire-and-forget; most modules ignore them.
    async fn notify(&self, _notification: JsonRpcRequest) -> ComposeResult<()> {
        Ok(())
    }
}

/// Transport adapter over an [`EmbeddedServer`].
pub struct EmbeddedTransport {
    server: Arc<dyn EmbeddedServer>,
    inbound_tx: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    inbound: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    is_connected: Arc<RwLock<bool>>,
}

impl EmbeddedTransport {
    pub fn new(server: Arc<dyn EmbeddedServer>) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            server,
            inbound_tx: Mutex::new(Some(tx)),
            inbound: Mutex::new(rx),
            is_connected: Arc::new(RwLock::new(true)),
        }
    }
}

#[async_trait]
impl Transport for EmbeddedTransport {
    async fn send(&self, message: JsonRpcMessage) -> ComposeResult<()> {
        if !self.is_connected().await {
            return Err(ComposeError::TransportError(
                "transport not connected".to_string(),
            ));
        }

        let request = match message {
            JsonRpcMessage::Request(request) => request,
            JsonRpcMessage::Response(_) => {
                // The composer never answers an embedded module; nothing to do.
                return Ok(());
            }
        };

        if request.is_notification() {
            debug!(module = self.server.name(), method = %request.method, "embedded notify");
            return self.server.notify(request).await;
        }

        let tx = self
            .inbound_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| ComposeError::TransportError("transport closed".to_string()))?;

        let server = self.server.clone();
        let is_connected = self.is_connected.clone();
        tokio::spawn(async move {
            match server.handle(request).await {
                Ok(response) => {
                    let _ = tx.send(JsonRpcMessage::Response(response)).await;
                }
                Err(e) => {
                    debug!(module = server.name(), "embedded handler failed: {}", e);
                    *is_connected.write().await = false;
                    // Dropping the cloned tx isn't enough while the
                    // transport holds its own; the close path drains it.
                }
            }
        });

        Ok(())
    }

    async fn receive(&self) -> Option<JsonRpcMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn close(&self) -> ComposeResult<()> {
        *self.is_connected.write().await = false;
        self.inbound_tx.lock().await.take();
        Ok(())
    }
}
