use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use correlated_telemetry::{registry, MetricsRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::GenericError;

/// Builds the router serving the metrics exposition.
pub fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(registry)
}

/// Serves the metrics exposition until cancellation is requested.
pub async fn serve(
    listener: TcpListener, registry: Arc<MetricsRegistry>, cancel: CancellationToken,
) -> Result<(), GenericError> {
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(Into::into)
}

async fn handle_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, registry::CONTENT_TYPE)], registry.render())
}
