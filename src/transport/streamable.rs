//! Streamable HTTP transport for remote backends.
//!
//! Each outbound message is an HTTP POST; the response body may carry any
//! number of JSON-RPC messages as newline-delimited JSON. Every response
//! stream feeds the same inbound channel so the composer sees one ordered
//! sequence per connection direction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::protocol::JsonRpcMessage;
use crate::transport::traits::Transport;
use crate::utils::errors::{ComposeError, ComposeResult};

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Streamable HTTP transport for remote servers.
pub struct StreamableHttpTransport {
    endpoint: Url,
    client: reqwest::Client,
    session_id: Arc<RwLock<Option<String>>>,
    /// Taken on close so the inbound channel drains shut once outstanding
    /// response readers finish.
    inbound_tx: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    inbound: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    is_connected: Arc<RwLock<bool>>,
    idle_timeout: Duration,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: impl Into<String>, idle_timeout: Duration) -> ComposeResult<Self> {
        let endpoint = endpoint
            .into()
            .parse::<Url>()
            .map_err(|e| ComposeError::TransportError(format!("invalid URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ComposeError::TransportError(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        Ok(Self {
            endpoint,
            client,
            session_id: Arc::new(RwLock::new(None)),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound: Mutex::new(inbound_rx),
            is_connected: Arc::new(RwLock::new(true)),
            idle_timeout,
        })
    }

    async fn start_reader(&self, response: reqwest::Response) {
        let tx = match self.inbound_tx.lock().await.as_ref() {
            Some(tx) => tx.clone(),
            None => return,
        };
        let is_connected = self.is_connected.clone();
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            let stream = response.bytes_stream();
            let reader = tokio_util::io::StreamReader::new(
                stream.map(|result| result.map_err(std::io::Error::other)),
            );
            let buf_reader = BufReader::new(reader);
            let mut lines = buf_reader.lines();

            loop {
                let line = match tokio::time::timeout(idle_timeout, lines.next_line()).await {
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("streamable response read error: {}", e);
                        // A broken mid-session stream closes the transport.
                        *is_connected.write().await = false;
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "streamable response idle for {}ms, dropping stream",
                            idle_timeout.as_millis()
                        );
                        break;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }
                debug!("streamable received: {}", line);

                match JsonRpcMessage::parse(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("malformed streamable frame skipped: {}", e);
                    }
                }
            }

            debug!("streamable response reader ended");
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
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: JsonRpcMessage) -> ComposeResult<()> {
        if !self.is_connected().await {
            return Err(ComposeError::TransportError(
                "transport not connected".to_string(),
            ));
        }

        let json = serde_json::to_string(&message)?;
        debug!("streamable sending: {}", json);

        let session_id = self.session_id.read().await.clone();
        let url = self.build_request_url(session_id);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/x-ndjson")
            .body(json)
            .send()
            .await
            .map_err(|e| {
                // The endpoint is gone; the whole exchange is over.
                ComposeError::TransportError(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(ComposeError::TransportError(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        if let Some(id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write().await;
            if session.as_deref() != Some(id) {
                info!("streamable HTTP session established: {}", id);
                *session = Some(id.to_string());
            }
        }

        self.start_reader(response).await;
        Ok(())
    }

    async fn receive(&self) -> Option<JsonRpcMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn close(&self) -> ComposeResult<()> {
        info!("closing streamable HTTP transport");

        let session_id = self.session_id.read().await.clone();
        if let Some(id) = session_id {
            let _ = self
                .client
                .delete(self.endpoint.clone())
                .query(&[("session_id", id)])
                .send()
                .await;
        }

        *self.is_connected.write().await = false;
        self.inbound_tx.lock().await.take();
        Ok(())
    }
}
