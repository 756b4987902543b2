use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::HttpConfig;
use crate::core::Composer;
use crate::http_server::middleware::principal_middleware;
use crate::http_server::routes;
use crate::utils::errors::{ComposeError, ComposeResult};
use crate::utils::shutdown::ShutdownCoordinator;

/// The HTTP frontend: the composed MCP endpoint plus the admin surface.
pub struct HttpServer {
    config: HttpConfig,
    composer: Arc<Composer>,
}

impl HttpServer {
    pub fn new(config: HttpConfig, composer: Arc<Composer>) -> Self {
        Self { config, composer }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/mcp", post(routes::mcp_handler))
            .route("/servers", get(routes::list_servers_handler))
            .route("/servers/{name}", get(routes::server_status_handler))
            .route("/servers/{name}/start", post(routes::start_server_handler))
            .route("/servers/{name}/stop", post(routes::stop_server_handler))
            .route(
                "/servers/{name}/restart",
                post(routes::restart_server_handler),
            )
            .route("/capabilities", get(routes::list_capabilities_handler))
            .route("/summary", get(routes::summary_handler))
            .route("/reload", post(routes::reload_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive())
                    .layer(axum::middleware::from_fn(principal_middleware)),
            )
            .with_state(self.composer.clone())
    }

    /// Bind and serve until the coordinator fires.
    pub async fn run(&self, shutdown: &ShutdownCoordinator) -> ComposeResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ComposeError::ConfigError(format!("failed to bind {}: {}", addr, e)))?;
        info!("HTTP frontend listening on {}", addr);

        let mut shutdown_rx = shutdown.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .map_err(|e| ComposeError::InternalError(e.to_string()))?;

        info!("HTTP frontend stopped");
        Ok(())
    }
}
