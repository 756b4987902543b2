//! Stdio frontend: serve the composed namespace over this process's own
//! stdin/stdout, newline-delimited JSON-RPC. Logs go to stderr; stdout
//! belongs to the protocol.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::core::protocol::{JsonRpcMessage, JsonRpcResponse};
use crate::core::Composer;
use crate::utils::errors::ComposeResult;
use crate::utils::shutdown::ShutdownCoordinator;

/// Read client requests from stdin until EOF or shutdown, answering on
/// stdout in completion order per request.
pub async fn serve(composer: Arc<Composer>, shutdown: &ShutdownCoordinator) -> ComposeResult<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();
    let mut shutdown_rx = shutdown.subscribe();

    info!("stdio frontend serving");
    loop {
        let line = tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("stdin closed, stopping stdio frontend");
                    break;
                }
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            },
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match JsonRpcMessage::parse(&line) {
            Ok(JsonRpcMessage::Request(request)) => composer.handle_request(request).await,
            Ok(JsonRpcMessage::Response(_)) => {
                debug!("ignoring response frame from client");
                None
            }
            Err(e) => {
                warn!("malformed client frame: {}", e);
                Some(JsonRpcResponse::error(None, -32700, "parse error"))
            }
        };

        if let Some(response) = response {
            let mut json = serde_json::to_string(&response)?;
            json.push('\n');
            stdout.write_all(json.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
