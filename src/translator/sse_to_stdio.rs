//! Expose a remote SSE endpoint on this process's own stdio.
//!
//! The inverse bridge: dials an existing event-stream endpoint and speaks
//! newline-delimited JSON on stdin/stdout, so stdio-only clients can reach
//! an SSE-only backend. Downlink frames keep arrival order; uplink lines
//! are POSTed in read order.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{TranslatorKind, TranslatorSpec};
use crate::core::server::ServerState;
use crate::translator::Translator;
use crate::utils::errors::{ComposeError, ComposeResult};

pub struct SseToStdioTranslator {
    spec: TranslatorSpec,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SseToStdioTranslator {
    pub fn new(spec: TranslatorSpec) -> Self {
        Self {
            spec,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Translator for SseToStdioTranslator {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> TranslatorKind {
        TranslatorKind::SseToStdio
    }

    fn state(&self) -> ServerState {
        *self.state.read()
    }

    async fn start(&self) -> ComposeResult<()> {
        {
            let mut state = self.state.write();
            if *state == ServerState::Running {
                return Ok(());
            }
            *state = ServerState::Starting;
        }

        let endpoint = self
            .spec
            .url
            .as_deref()
            .ok_or_else(|| {
                ComposeError::ConfigError(format!("translator '{}': missing url", self.spec.name))
            })?
            .parse::<Url>()
            .map_err(|e| ComposeError::ConfigError(format!("invalid url: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ComposeError::TransportError(e.to_string()))?;

        let response = client
            .get(endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| {
                *self.state.write() = ServerState::Crashed;
                ComposeError::StartupFailure(format!("failed to dial {}: {}", endpoint, e))
            })?;

        if !response.status().is_success() {
            *self.state.write() = ServerState::Crashed;
            return Err(ComposeError::StartupFailure(format!(
                "HTTP error dialing {}: {}",
                endpoint,
                response.status()
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let name = self.spec.name.clone();

        // Downlink: remote SSE events -> own stdout.
        let state = self.state.clone();
        let mut down_shutdown = shutdown_rx.clone();
        let down_name = name.clone();
        tasks.push(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut stdout = tokio::io::stdout();
            let mut buffer = String::new();
            let mut event_data = String::new();

            'outer: loop {
                let chunk = tokio::select! {
                    _ = down_shutdown.changed() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            error!(translator = %down_name, "SSE stream error: {}", e);
                            break;
                        }
                        None => {
                            info!(translator = %down_name, "SSE stream closed by peer");
                            break;
                        }
                    },
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let mut line = buffer[..pos].to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    if line.is_empty() {
                        if event_data.is_empty() {
                            continue;
                        }
                        let mut payload = event_data.trim_end_matches('\n').to_string();
                        event_data.clear();
                        debug!(translator = %down_name, "sse -> stdout: {}", payload);
                        payload.push('\n');
                        if stdout.write_all(payload.as_bytes()).await.is_err()
                            || stdout.flush().await.is_err()
                        {
                            break 'outer;
                        }
                        continue;
                    }
                    if let Some(data) = line.strip_prefix("data:") {
                        event_data.push_str(data.trim_start());
                        event_data.push('\n');
                    }
                }
            }

            let mut state = state.write();
            if *state == ServerState::Running {
                *state = ServerState::Crashed;
            }
        }));

        // Uplink: own stdin lines -> POST to the endpoint.
        let mut up_shutdown = shutdown_rx;
        let up_name = name;
        tasks.push(tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            loop {
                let line = tokio::select! {
                    _ = up_shutdown.changed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    },
                };
                if line.trim().is_empty() {
                    continue;
                }
                debug!(translator = %up_name, "stdin -> sse: {}", line);
                let result = client
                    .post(endpoint.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(line)
                    .send()
                    .await;
                match result {
                    Ok(response) if !response.status().is_success() => {
                        warn!(translator = %up_name, "endpoint rejected message: {}", response.status());
                    }
                    Err(e) => {
                        warn!(translator = %up_name, "failed to forward message: {}", e);
                    }
                    _ => {}
                }
            }
            debug!(translator = %up_name, "stdin uplink ended");
        }));

        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.tasks.lock().await = tasks;
        *self.state.write() = ServerState::Running;
        info!(translator = self.name(), "stdio bridge running");
        Ok(())
    }

    async fn stop(&self) -> ComposeResult<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, ServerState::Stopped | ServerState::Stopping) {
                return Ok(());
            }
            *state = ServerState::Stopping;
        }

        if let Some(shutdown) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown.send(true);
        }
        for mut task in self.tasks.lock().await.drain(..) {
            if tokio::time::timeout(std::time::Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        *self.state.write() = ServerState::Stopped;
        info!(translator = self.name(), "bridge stopped");
        Ok(())
    }
}
