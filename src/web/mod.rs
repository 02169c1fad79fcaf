//! Web server module: the admin and report API.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
}

/// Web server for the signal monitor.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>) -> Self {
        Self {
            state: AppState { config, store },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/health", get(handlers::handle_health))
            // Sources and their channels
            .route("/api/sources", get(handlers::handle_get_sources).post(handlers::handle_create_source))
            .route(
                "/api/sources/{id}",
                put(handlers::handle_update_source).delete(handlers::handle_delete_source),
            )
            .route("/api/sources/{id}/channels", get(handlers::handle_get_channels))
            .route(
                "/api/sources/{id}/channels/{channel_id}",
                put(handlers::handle_set_channel_enabled),
            )
            // Reports
            .route("/api/status", get(handlers::handle_get_status))
            .route("/api/outages", get(handlers::handle_get_outages))
            // Admin
            .route("/api/admin/reset-history/dry", get(handlers::handle_reset_history_dry))
            .route("/api/admin/reset-history", post(handlers::handle_reset_history))
            .route(
                "/api/destinations",
                get(handlers::handle_get_destinations).post(handlers::handle_create_destination),
            )
            .route("/api/destinations/{id}", delete(handlers::handle_delete_destination))
            .route(
                "/api/settings/{key}",
                get(handlers::handle_get_setting).put(handlers::handle_put_setting),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}
