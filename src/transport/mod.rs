pub mod embedded;
pub mod sse;
pub mod stdio;
pub mod streamable;
pub mod traits;

pub use embedded::{EmbeddedServer, EmbeddedTransport};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;
pub use traits::{Transport, TransportFactory};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ComposeConfig, ServerKind, ServerSpec};
use crate::utils::errors::{ComposeError, ComposeResult};

/// The default factory: picks the adapter from `ServerSpec.kind`.
///
/// Embedded modules are registered up front by name; everything else is
/// constructed from the spec's launch data.
#[derive(Default)]
pub struct StandardTransportFactory {
    embedded: HashMap<String, Arc<dyn EmbeddedServer>>,
}

impl StandardTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process module under the name specs refer to.
    pub fn register_embedded(&mut self, server: Arc<dyn EmbeddedServer>) {
        self.embedded.insert(server.name().to_string(), server);
    }
}

#[async_trait]
impl TransportFactory for StandardTransportFactory {
    async fn create(&self, spec: &ServerSpec) -> ComposeResult<Box<dyn Transport>> {
        match spec.kind {
            ServerKind::StdioProcess => {
                let command = spec.command.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!("server '{}': missing command", spec.name))
                })?;
                let (program, args) = ComposeConfig::split_command(command, &spec.args)?;
                let transport = StdioTransport::spawn(
                    program,
                    args,
                    spec.env.clone(),
                    Duration::from_millis(spec.write_timeout_ms),
                )
                .await?;
                Ok(Box::new(transport))
            }
            ServerKind::SseRemote => {
                let url = spec.url.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!("server '{}': missing url", spec.name))
                })?;
                let transport =
                    SseTransport::connect(url, Duration::from_millis(spec.idle_timeout_ms)).await?;
                Ok(Box::new(transport))
            }
            ServerKind::StreamableHttpRemote => {
                let url = spec.url.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!("server '{}': missing url", spec.name))
                })?;
                let transport =
                    StreamableHttpTransport::new(url, Duration::from_millis(spec.idle_timeout_ms))?;
                Ok(Box::new(transport))
            }
            ServerKind::Embedded => {
                let module = spec.module.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!("server '{}': missing module", spec.name))
                })?;
                let server = self.embedded.get(module).cloned().ok_or_else(|| {
                    ComposeError::ConfigError(format!(
                        "server '{}': embedded module '{}' is not registered",
                        spec.name, module
                    ))
                })?;
                Ok(Box::new(EmbeddedTransport::new(server)))
            }
        }
    }
}
