//! Web server module.

mod error;
mod handlers;
mod inventory;

pub use error::*;
pub use handlers::*;
pub use inventory::*;

use crate::check::Registry;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::metrics::MetricsStore;
use crate::status::StatusTracker;
use crate::stream::StreamPublisher;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub tracker: Arc<StatusTracker>,
    pub metrics: Arc<MetricsStore>,
    pub streams: Arc<StreamPublisher>,
}

/// Web server for RMON.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Checks. `{key}/{sub}` is either `{kind}/{id}` or
            // `{id}/status|statuses`; the handler tells them apart.
            .route(
                "/rmon/check/{key}",
                post(handlers::handle_create_check).get(handlers::handle_list_kind),
            )
            .route(
                "/rmon/check/{key}/{sub}",
                get(handlers::handle_check_get)
                    .put(handlers::handle_update_check)
                    .delete(handlers::handle_delete_check),
            )
            .route(
                "/rmon/check/{key}/{sub}/metrics",
                get(handlers::handle_check_metrics),
            )
            .route("/rmon/checks", get(handlers::handle_list_checks))
            .route("/rmon/checks/move", post(handlers::handle_move_checks))
            .route("/rmon/checks/{kind}", get(handlers::handle_list_checks_kind))
            .route(
                "/rmon/history/metrics/stream/{check_id}/{check_type_id}",
                get(handlers::handle_metrics_stream),
            )
            // Placement entities
            .route("/rmon/agents", get(inventory::handle_list_agents))
            .route("/rmon/agent", post(inventory::handle_create_agent))
            .route(
                "/rmon/agent/{id}",
                get(inventory::handle_get_agent)
                    .put(inventory::handle_update_agent)
                    .delete(inventory::handle_delete_agent),
            )
            .route("/rmon/regions", get(inventory::handle_list_regions))
            .route("/rmon/region", post(inventory::handle_create_region))
            .route(
                "/rmon/region/{id}",
                get(inventory::handle_get_region)
                    .put(inventory::handle_update_region)
                    .delete(inventory::handle_delete_region),
            )
            .route("/rmon/countries", get(inventory::handle_list_countries))
            .route("/rmon/country", post(inventory::handle_create_country))
            .route(
                "/rmon/country/{id}",
                get(inventory::handle_get_country)
                    .put(inventory::handle_update_country)
                    .delete(inventory::handle_delete_country),
            )
            // Status pages
            .route("/rmon/status-pages", get(inventory::handle_list_status_pages))
            .route("/rmon/status-page", post(inventory::handle_create_status_page))
            .route(
                "/rmon/status-page/{id}",
                get(inventory::handle_get_status_page)
                    .put(inventory::handle_update_status_page)
                    .delete(inventory::handle_delete_status_page),
            )
            .route(
                "/rmon/status-page/{id}/status",
                get(inventory::handle_status_page_status),
            )
            .route(
                "/rmon/status-page/slug/{slug}",
                get(inventory::handle_status_page_by_slug),
            )
            // Notification channels
            .route("/rmon/channels", get(inventory::handle_list_channels))
            .route("/rmon/channel", post(inventory::handle_create_channel))
            .route(
                "/rmon/channel/{id}",
                get(inventory::handle_get_channel)
                    .put(inventory::handle_update_channel)
                    .delete(inventory::handle_delete_channel),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
