//! Read-only HTTP status endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::status::StatusStore;

type Result<T> = std::result::Result<T, Error>;

pub fn router(status: Arc<StatusStore>) -> Router {
    Router::new()
        .route("/api/v1/", get(all_statuses))
        .with_state(status)
}

/// Every device's last-known status, pretty-printed.
async fn all_statuses(State(status): State<Arc<StatusStore>>) -> Response {
    match serde_json::to_string_pretty(&status.snapshot()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Serve the status endpoint until cancelled.
pub async fn serve(
    addr: SocketAddr,
    status: Arc<StatusStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::socket("bind", e))?;
    info!("Status endpoint listening on http://{addr}/api/v1/");

    axum::serve(listener, router(status))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::socket("serve", e))
}
