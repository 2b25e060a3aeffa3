//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ManagerError;
use crate::server::handlers::{
    create_order_handler, get_logs_handler, get_order_handler, get_orders_handler,
    get_target_handler, get_targets_handler, health_handler, order_status_handler,
    request_logs_handler, stop_all_handler, stop_command_handler, stop_target_handler,
    target_command_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the control-plane API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Orders
        .route("/orders", get(get_orders_handler).post(create_order_handler))
        .route("/orders/{id}", get(get_order_handler))
        .route("/orders/{id}/status", get(order_status_handler))
        // Targets
        .route("/targets", get(get_targets_handler))
        .route("/targets/{id}", get(get_target_handler))
        .route("/targets/{id}/logs", put(request_logs_handler))
        .route(
            "/targets/{id}/command",
            put(target_command_handler).delete(stop_command_handler),
        )
        .route("/targets/{id}/stop", put(stop_target_handler))
        .route("/stop", put(stop_all_handler))
        // Logs
        .route("/logs", get(get_logs_handler))
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ManagerError>>, ManagerError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ManagerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ManagerError::ServerError(e.to_string()))
    });

    Ok(handle)
}
