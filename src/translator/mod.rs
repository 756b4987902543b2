//! Protocol translators.
//!
//! A translator makes a backend speaking transport A reachable by clients
//! expecting transport B, with neither side aware of the bridge. It shares
//! the managed-server lifecycle contract and registers in the composer by
//! name; its "process" is the bridge itself, and closing it tears down
//! both sides.

pub mod sse_to_stdio;
pub mod stdio_to_sse;

pub use sse_to_stdio::SseToStdioTranslator;
pub use stdio_to_sse::StdioToSseTranslator;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{TranslatorKind, TranslatorSpec};
use crate::core::server::ServerState;
use crate::utils::errors::ComposeResult;

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TranslatorKind;
    fn state(&self) -> ServerState;

    async fn start(&self) -> ComposeResult<()>;

    /// Tear down both sides of the bridge. Idempotent.
    async fn stop(&self) -> ComposeResult<()>;
}

/// Build a translator from its validated spec.
pub fn build(spec: &TranslatorSpec) -> ComposeResult<Arc<dyn Translator>> {
    spec.validate_kind()?;
    Ok(match spec.kind {
        TranslatorKind::StdioToSse => Arc::new(StdioToSseTranslator::new(spec.clone())),
        TranslatorKind::SseToStdio => Arc::new(SseToStdioTranslator::new(spec.clone())),
    })
}
