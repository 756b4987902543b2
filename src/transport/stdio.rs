//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::protocol::JsonRpcMessage;
use crate::transport::traits::Transport;
use crate::utils::errors::{ComposeError, ComposeResult};

/// Buffered inbound frames before backpressure on the reader task.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Stdio transport for process-backed servers.
pub struct StdioTransport {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    inbound: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    is_connected: Arc<RwLock<bool>>,
    write_timeout: Duration,
}

impl StdioTransport {
    pub async fn spawn(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        write_timeout: Duration,
    ) -> ComposeResult<Self> {
        let command = command.into();
        let mut child = tokio::process::Command::new(&command)
            .args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ComposeError::StartupFailure(format!("failed to spawn '{}': {}", command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ComposeError::TransportError("failed to open stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ComposeError::TransportError("failed to open stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let is_connected = Arc::new(RwLock::new(true));

        let reader_connected = is_connected.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                debug!("stdio received: {}", line);

                match JsonRpcMessage::parse(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // A malformed frame means the stream can no longer
                        // be trusted; treat it like a disconnect.
                        warn!("malformed stdio frame, closing transport: {}", e);
                        break;
                    }
                }
            }

            debug!("stdio reader task ended");
            *reader_connected.write().await = false;
            // Dropping tx closes the inbound channel; receive() yields None.
        });

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            inbound: Mutex::new(rx),
            is_connected,
            write_timeout,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: JsonRpcMessage) -> ComposeResult<()> {
        if !self.is_connected().await {
            return Err(ComposeError::TransportError(
                "transport not connected".to_string(),
            ));
        }

        let mut json = serde_json::to_string(&message)?;
        json.push('\n');
        debug!("stdio sending: {}", json.trim_end());

        // A child that stopped draining its input must not wedge the
        // composer; an overdue write closes the transport.
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *self.is_connected.write().await = false;
                Err(ComposeError::Io(e))
            }
            Err(_) => {
                *self.is_connected.write().await = false;
                Err(ComposeError::TransportError(format!(
                    "write timed out after {}ms",
                    self.write_timeout.as_millis()
                )))
            }
        }
    }

    async fn receive(&self) -> Option<JsonRpcMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn close(&self) -> ComposeResult<()> {
        let mut child = self.child.lock().await;

        if child.try_wait().ok().flatten().is_none() {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill child process: {}", e);
            }
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => info!("child process exited with {:?}", status),
                Ok(Err(e)) => warn!("failed to wait for child: {}", e),
                Err(_) => warn!("timeout waiting for child process"),
            }
        }

        *self.is_connected.write().await = false;
        Ok(())
    }
}
