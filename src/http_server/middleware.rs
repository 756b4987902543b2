//! Authentication boundary.
//!
//! Requests arrive pre-authenticated by an upstream gateway; this crate
//! never sees credentials or tokens. The only thing threaded through is
//! the principal identifier the authenticator attached, or "anonymous".

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub const PRINCIPAL_HEADER: &str = "x-mcp-principal";

#[derive(Debug, Clone)]
pub struct Principal(pub String);

impl Principal {
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Attach the caller's principal to the request extensions.
pub async fn principal_middleware(mut request: Request, next: Next) -> Response {
    let principal = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| Principal(s.to_string()))
        .unwrap_or_else(Principal::anonymous);

    request.extensions_mut().insert(principal);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_principal() {
        assert_eq!(Principal::anonymous().as_str(), "anonymous");
    }
}
