use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("startup failure: {0}")]
    StartupFailure(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("unknown capability: {0}")]
    NotFound(String),

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("capability conflict: '{name}' from '{incoming_server}' already registered by '{existing_server}'")]
    RegistrationConflict {
        name: String,
        existing_server: String,
        incoming_server: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for ComposeError {
    fn from(e: anyhow::Error) -> Self {
        ComposeError::InternalError(e.to_string())
    }
}

impl ComposeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TransportError(_) | Self::StartupFailure(_) => StatusCode::BAD_GATEWAY,
            Self::RegistrationConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::StartupFailure(_) => "STARTUP_FAILURE",
            Self::TransportError(_) => "TRANSPORT_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ServerUnavailable(_) => "SERVER_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::RegistrationConflict { .. } => "REGISTRATION_CONFLICT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// JSON-RPC error code for surfacing this failure to a protocol client.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => -32601,
            Self::InvalidRequest(_) => -32600,
            Self::Serialization(_) => -32700,
            _ => -32000,
        }
    }
}

impl IntoResponse for ComposeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type ComposeResult<T> = Result<T, ComposeError>;
