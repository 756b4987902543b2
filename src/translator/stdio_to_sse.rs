//! Expose a stdio-speaking child process as an SSE endpoint.
//!
//! Every frame the child writes is pushed to all currently connected SSE
//! subscribers in arrival order (broadcast, not load-balanced). Messages
//! POSTed by any subscriber are funneled through one queue to the child's
//! stdin, so the child sees each subscriber's messages in its send order.

use std::convert::Infallible;
use std::process::Stdio;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ComposeConfig, TranslatorKind, TranslatorSpec};
use crate::core::server::ServerState;
use crate::translator::Translator;
use crate::utils::errors::{ComposeError, ComposeResult};

const FRAME_CHANNEL_CAPACITY: usize = 256;

struct BridgeShared {
    frames_tx: broadcast::Sender<String>,
    inbound_tx: mpsc::Sender<String>,
}

pub struct StdioToSseTranslator {
    spec: TranslatorSpec,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: RwLock<Option<std::net::SocketAddr>>,
}

impl StdioToSseTranslator {
    pub fn new(spec: TranslatorSpec) -> Self {
        Self {
            spec,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            bound: RwLock::new(None),
        }
    }

    /// The address the listener actually bound, once running. With a
    /// `:0` listen spec this is where the ephemeral port shows up.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound.read()
    }

    fn router(shared: Arc<BridgeShared>) -> Router {
        Router::new()
            .route("/sse", get(sse_handler))
            .route("/messages", post(messages_handler))
            .with_state(shared)
    }
}

async fn sse_handler(
    State(shared): State<Arc<BridgeShared>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = shared.frames_tx.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    return Some((Ok(Event::default().event("message").data(frame)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged, frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn messages_handler(
    State(shared): State<Arc<BridgeShared>>,
    Json(body): Json<Value>,
) -> StatusCode {
    match shared.inbound_tx.send(body.to_string()).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[async_trait::async_trait]
impl Translator for StdioToSseTranslator {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> TranslatorKind {
        TranslatorKind::StdioToSse
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

        let command = self.spec.command.as_deref().ok_or_else(|| {
            ComposeError::ConfigError(format!("translator '{}': missing command", self.spec.name))
        })?;
        let (program, args) = ComposeConfig::split_command(command, &self.spec.args)?;

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                *self.state.write() = ServerState::Crashed;
                ComposeError::StartupFailure(format!("failed to spawn '{}': {}", program, e))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ComposeError::TransportError("failed to open child stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ComposeError::TransportError("failed to open child stdout".to_string())
        })?;

        let listen: std::net::SocketAddr = self
            .spec
            .listen
            .as_deref()
            .ok_or_else(|| {
                ComposeError::ConfigError(format!(
                    "translator '{}': missing listen address",
                    self.spec.name
                ))
            })?
            .parse()
            .map_err(|e| ComposeError::ConfigError(format!("invalid listen address: {}", e)))?;

        let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let name = self.spec.name.clone();
        let mut tasks = Vec::new();

        // Child stdout -> every subscriber, in arrival order.
        let frames_out = frames_tx.clone();
        let state = self.state.clone();
        let reader_name = name.clone();
        tasks.push(tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(translator = %reader_name, "child -> sse: {}", line);
                // No subscribers connected is fine; frames before the first
                // subscriber are dropped by design of broadcast.
                let _ = frames_out.send(line);
            }
            info!(translator = %reader_name, "child stdout closed");
            let mut state = state.write();
            if *state == ServerState::Running {
                *state = ServerState::Crashed;
            }
        }));

        // Subscriber POSTs -> child stdin, one writer preserving order.
        let writer_name = name.clone();
        let mut writer_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_shutdown.changed() => break,
                    message = inbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                debug!(translator = %writer_name, "sse -> child: {}", message);
                if stdin.write_all(message.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            debug!(translator = %writer_name, "inbound writer ended");
        }));

        // The SSE listener.
        let shared = Arc::new(BridgeShared {
            frames_tx,
            inbound_tx,
        });
        let app = Self::router(shared);
        let listener = match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write() = ServerState::Crashed;
                return Err(ComposeError::StartupFailure(format!(
                    "failed to bind {}: {}",
                    listen, e
                )));
            }
        };
        let bound = listener
            .local_addr()
            .map_err(|e| ComposeError::StartupFailure(e.to_string()))?;
        *self.bound.write() = Some(bound);
        info!(translator = %name, %bound, "SSE bridge listening");

        let mut serve_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = serve_shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!("SSE bridge server error: {}", e);
            }
        }));

        // Child reaper: hold the handle until shutdown, then make sure the
        // process is gone.
        let mut reap_shutdown = shutdown_rx;
        let reaper_name = name;
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(translator = %reaper_name, "child exited: {:?}", status);
                }
                _ = reap_shutdown.changed() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }));

        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.tasks.lock().await = tasks;
        *self.state.write() = ServerState::Running;
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
                warn!(translator = self.name(), "bridge task did not stop in time");
                task.abort();
            }
        }

        *self.state.write() = ServerState::Stopped;
        info!(translator = self.name(), "bridge stopped");
        Ok(())
    }
}
