use std::sync::Arc;

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as AxumJson, Response};
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::capability::CapabilityKind;
use crate::core::protocol::JsonRpcRequest;
use crate::core::Composer;
use crate::http_server::middleware::Principal;
use crate::utils::errors::ComposeError;

pub type SharedComposer = Arc<Composer>;

/// Health check endpoint
pub async fn health() -> AxumJson<Value> {
    AxumJson(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Main MCP endpoint: one JSON-RPC request in, one response out.
pub async fn mcp_handler(
    State(composer): State<SharedComposer>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    debug!(principal = principal.as_str(), method = %request.method, "client request");

    match composer.handle_request(request).await {
        Some(response) => Json(response).into_response(),
        // Notifications produce no body at the HTTP layer.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// List all managed servers and translators with their states.
pub async fn list_servers_handler(State(composer): State<SharedComposer>) -> AxumJson<Value> {
    let servers = composer.list_servers();
    AxumJson(json!({
        "servers": servers,
        "count": servers.len(),
    }))
}

/// One server's status.
pub async fn server_status_handler(
    Path(name): Path<String>,
    State(composer): State<SharedComposer>,
) -> Result<AxumJson<Value>, ComposeError> {
    let status = composer
        .get_server(&name)
        .ok_or_else(|| ComposeError::NotFound(format!("unknown server: '{}'", name)))?;
    Ok(AxumJson(json!(status)))
}

pub async fn start_server_handler(
    Path(name): Path<String>,
    State(composer): State<SharedComposer>,
) -> Result<AxumJson<Value>, ComposeError> {
    let status = composer.start(&name).await?;
    Ok(AxumJson(json!(status)))
}

pub async fn stop_server_handler(
    Path(name): Path<String>,
    State(composer): State<SharedComposer>,
) -> Result<AxumJson<Value>, ComposeError> {
    let status = composer.stop(&name).await?;
    Ok(AxumJson(json!(status)))
}

pub async fn restart_server_handler(
    Path(name): Path<String>,
    State(composer): State<SharedComposer>,
) -> Result<AxumJson<Value>, ComposeError> {
    let status = composer.restart(&name).await?;
    Ok(AxumJson(json!(status)))
}

#[derive(Debug, Deserialize)]
pub struct CapabilityQuery {
    pub kind: Option<CapabilityKind>,
    pub filter: Option<String>,
}

/// The merged namespace, for the admin surface.
pub async fn list_capabilities_handler(
    State(composer): State<SharedComposer>,
    Query(query): Query<CapabilityQuery>,
) -> AxumJson<Value> {
    let capabilities = composer.list_capabilities(query.kind, query.filter.as_deref());
    AxumJson(json!({
        "capabilities": capabilities,
        "count": capabilities.len(),
    }))
}

/// Composition totals and the conflicts settled along the way.
pub async fn summary_handler(State(composer): State<SharedComposer>) -> AxumJson<Value> {
    AxumJson(json!(composer.summary()))
}

#[derive(Debug, Deserialize)]
pub struct ReloadBody {
    #[serde(default)]
    pub servers: Vec<crate::config::ServerSpec>,
    #[serde(default)]
    pub translators: Vec<crate::config::TranslatorSpec>,
}

/// Reload with a new spec set; unaffected servers keep running.
pub async fn reload_handler(
    State(composer): State<SharedComposer>,
    Json(body): Json<ReloadBody>,
) -> Result<AxumJson<Value>, ComposeError> {
    let report = composer.reload(body.servers, body.translators).await?;
    Ok(AxumJson(json!(report)))
}
