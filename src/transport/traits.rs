use crate::config::ServerSpec;
use crate::core::protocol::JsonRpcMessage;
use crate::utils::errors::ComposeResult;
use async_trait::async_trait;

/// One wire to one backend.
///
/// A transport only frames and moves messages; it holds no request state.
/// Correlation of in-flight calls lives in the composer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one framed message. Fails if the channel is closed or the peer
    /// rejected the write; a write that cannot complete within the
    /// transport's guard window also fails and marks the transport closed.
    async fn send(&self, message: JsonRpcMessage) -> ComposeResult<()>;

    /// Receive the next inbound frame, in arrival order. `None` once the
    /// peer has disconnected or the process exited.
    async fn receive(&self) -> Option<JsonRpcMessage>;

    /// Check if the transport is connected
    async fn is_connected(&self) -> bool;

    /// Close the transport. Idempotent and safe to call concurrently.
    async fn close(&self) -> ComposeResult<()>;
}

/// Creates transports from server specs. The composer owns one factory;
/// tests inject their own to drive the lifecycle without real backends.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, spec: &ServerSpec) -> ComposeResult<Box<dyn Transport>>;
}
