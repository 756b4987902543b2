//! SSE (Server-Sent Events) transport for remote backends.
//!
//! A long-lived GET carries the backend's frames as `data:` events; outbound
//! messages go over POST to the same endpoint. A stream that stays silent
//! past the idle window (no data, no heartbeat comment) is treated as a
//! disconnect rather than waited on forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::core::protocol::JsonRpcMessage;
use crate::transport::traits::Transport;
use crate::utils::errors::{ComposeError, ComposeResult};

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// SSE transport for remote servers.
pub struct SseTransport {
    endpoint: Url,
    client: reqwest::Client,
    session_id: Arc<RwLock<Option<String>>>,
    inbound: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    is_connected: Arc<RwLock<bool>>,
    close_tx: watch::Sender<bool>,
}

impl SseTransport {
    pub async fn connect(endpoint: impl Into<String>, idle_timeout: Duration) -> ComposeResult<Self> {
        let endpoint = endpoint
            .into()
            .parse::<Url>()
            .map_err(|e| ComposeError::TransportError(format!("invalid URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ComposeError::TransportError(e.to_string()))?;

        info!("connecting to SSE endpoint: {}", endpoint);
        let response = client
            .get(endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ComposeError::TransportError(format!("failed to connect: {}", e)))?;

        if !response.status().is_success() {
            return Err(ComposeError::TransportError(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let session_id = Arc::new(RwLock::new(
            response
                .headers()
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        ));

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let is_connected = Arc::new(RwLock::new(true));

        Self::start_reader(response, tx, is_connected.clone(), close_rx, idle_timeout);
        info!("SSE connection established");

        Ok(Self {
            endpoint,
            client,
            session_id,
            inbound: Mutex::new(rx),
            is_connected,
            close_tx,
        })
    }

    fn start_reader(
        response: reqwest::Response,
        tx: mpsc::Sender<JsonRpcMessage>,
        is_connected: Arc<RwLock<bool>>,
        mut close_rx: watch::Receiver<bool>,
        idle_timeout: Duration,
    ) {
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut event_data = String::new();

            'outer: loop {
                let chunk = tokio::select! {
                    _ = close_rx.changed() => {
                        debug!("SSE reader: close requested");
                        break;
                    }
                    chunk = tokio::time::timeout(idle_timeout, stream.next()) => match chunk {
                        Ok(Some(Ok(bytes))) => bytes,
                        Ok(Some(Err(e))) => {
                            error!("SSE stream error: {}", e);
                            break;
                        }
                        Ok(None) => {
                            debug!("SSE stream closed by peer");
                            break;
                        }
                        Err(_) => {
                            // No bytes and no heartbeat inside the idle
                            // window: a silent disconnect.
                            warn!(
                                "SSE stream idle for {}ms, treating as disconnect",
                                idle_timeout.as_millis()
                            );
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

                    // Comment lines are heartbeats; arriving at all reset
                    // the idle window above.
                    if line.starts_with(':') {
                        continue;
                    }

                    if line.is_empty() {
                        if event_data.is_empty() {
                            continue;
                        }
                        let payload = event_data.trim_end_matches('\n').to_string();
                        event_data.clear();

                        match JsonRpcMessage::parse(&payload) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break 'outer;
                                }
                            }
                            Err(e) => {
                                debug!("skipping non-message SSE event: {}", e);
                            }
                        }
                        continue;
                    }

                    if let Some(data) = line.strip_prefix("data:") {
                        event_data.push_str(data.trim_start());
                        event_data.push('\n');
                    }
                }
            }

            info!("SSE reader task ended");
            *is_connected.write().await = false;
        });
    }

    fn build_request_url(&self, session_id: Option<String>) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(id) = session_id {
            url.query_pairs_mut().append_pair("session_id", &id);
        }
        url
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: JsonRpcMessage) -> ComposeResult<()> {
        if !self.is_connected().await {
            return Err(ComposeError::TransportError(
                "transport not connected".to_string(),
            ));
        }

        let json = serde_json::to_string(&message)?;
        debug!("SSE sending: {}", json);

        let session_id = self.session_id.read().await.clone();
        let url = self.build_request_url(session_id);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(json)
            .send()
            .await
            .map_err(|e| ComposeError::TransportError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ComposeError::TransportError(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn receive(&self) -> Option<JsonRpcMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn close(&self) -> ComposeResult<()> {
        info!("closing SSE transport");
        let _ = self.close_tx.send(true);
        *self.is_connected.write().await = false;
        Ok(())
    }
}
