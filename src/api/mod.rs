//! HTTP control and status API.
//!
//! Operators use it to inspect the queue and runs, cancel and reschedule
//! work, and adjust publish limits. Remote workers use the `/assign` and
//! `/active-runs` endpoints to pull work and report progress.

mod handlers;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics::metrics_handler;
use crate::publisher::{PublishError, Publisher};
use crate::queue::{Queue, QueueError};
use crate::runner::{Runner, RunnerError};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{StateStore, StoreError};

/// Shared handles for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn Queue>,
    pub runner: Arc<Runner>,
    pub scheduler: Arc<Scheduler>,
    pub publisher: Arc<Publisher>,
}

/// Errors returned by handlers, mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::ItemNotFound(_) => ApiError::NotFound(error.to_string()),
            QueueError::InvalidState { .. } => ApiError::Conflict(error.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(error: RunnerError) -> Self {
        match error {
            RunnerError::UnknownRun(_) => ApiError::NotFound(error.to_string()),
            RunnerError::Queue(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::InvalidRequest(message) => ApiError::BadRequest(message),
            SchedulerError::Queue(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::UnknownRun(_) | PublishError::UnknownProposal(_) => {
                ApiError::NotFound(error.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/queue", get(handlers::queue))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/reschedule", post(handlers::reschedule))
        .route("/events", get(handlers::events))
        .route("/policies", get(handlers::policies))
        .route("/policies/{maintainer}", post(handlers::set_policy))
        .route("/publish/{run_id}", post(handlers::publish))
        .route("/proposals/status", post(handlers::proposal_status))
        .route("/assign", post(workers::assign))
        .route("/active-runs/{id}/start", post(workers::start))
        .route("/active-runs/{id}/heartbeat", post(workers::heartbeat))
        .route("/active-runs/{id}/finish", post(workers::finish))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until shutdown.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
