//! HTTP route surface.
//!
//! JSON over axum. Failures are rendered as
//! `{"status": "error", "error": "<message>"}` with a mapped status code.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AppState;
use crate::{AppError, Result};

/// Error wrapper rendered as a JSON error body.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status for the wrapped error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::PairingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::PairingRejected(_) | AppError::ConnectionClosed(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "status": "error", "error": self.0.message() }));
        (status, body).into_response()
    }
}

/// Handler result type.
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/processes", get(handlers::list_processes))
        .route("/bots/{id}", get(handlers::bot_status))
        .route("/bots/{id}/deploy", post(handlers::deploy))
        .route("/bots/{id}/stop", post(handlers::stop))
        .route("/bots/{id}/restart", post(handlers::restart))
        .route("/bots/{id}/process", get(handlers::process_info))
        .route("/bots/{id}/pair", post(handlers::pair))
        .route("/bots/{id}/verify", post(handlers::verify))
        .route(
            "/sessions/{owner}/{bot}",
            get(handlers::session_status).delete(handlers::delete_session),
        )
        .route("/sessions/{owner}/{bot}/info", get(handlers::session_info))
        .with_state(state)
}

/// Serve the route table on `config.http_port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind or the server
/// fails.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("HTTP server error: {err}")))?;

    info!("HTTP API shut down");
    Ok(())
}
