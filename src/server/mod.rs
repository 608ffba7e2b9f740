//! HTTP trigger endpoint and WebSocket dashboard.
//!
//! Both share one axum listener: `/ws` is the dashboard, every other single-segment path
//! is an HTTP command (`ping`, `calculate`, `calculate_ph`).

pub mod dashboard;
pub mod http;

pub use dashboard::{ClientBroadcastSession, DashboardEvent, DashboardStatus, RequestData};
pub use http::{
    CalculationRequest, HttpReply, RequestSession, SessionEvent, ALREADY_IN_PROGRESS,
    REQUEST_TIMED_OUT, REQUEST_TIMEOUT,
};

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{AppResult, StationError};

/// Combined router with request tracing.
pub fn router(session: &RequestSession, dashboard: &ClientBroadcastSession) -> Router {
    Router::new()
        .merge(dashboard.router())
        .merge(session.router())
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` on `address` until `cancel` fires.
pub async fn serve(address: &str, router: Router, cancel: CancellationToken) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| StationError::Server(format!("failed to bind {address}: {e}")))?;
    info!(%address, "Listening for HTTP commands and dashboard clients");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| StationError::Server(e.to_string()))
}
