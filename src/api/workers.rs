//! Endpoints for remote workers.
//!
//! A remote worker polls `/assign`, then reports `start`, periodic
//! `heartbeat`s and a final `finish` for the run it was given, naming itself
//! with `?worker=`. A 404 on any of the run endpoints means the lease is gone
//! and the worker should stop; a 403 means the run is leased to another
//! worker.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Run, WorkerReport};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    worker: String,
    #[serde(default)]
    suites: Option<Vec<String>>,
}

/// Returns an assignment, or 204 when nothing is eligible.
pub async fn assign(
    State(state): State<AppState>,
    Json(request): Json<AssignRequest>,
) -> Result<Response, ApiError> {
    if request.worker.trim().is_empty() {
        return Err(ApiError::BadRequest("worker name is required".to_string()));
    }

    let suites = request.suites.map(|s| s.into_iter().collect());
    match state.runner.assign_remote(&request.worker, suites).await? {
        Some(assignment) => Ok(Json(assignment).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Serialize)]
pub struct Ack {
    run_id: Uuid,
}

/// Identifies the worker reporting on a run.
#[derive(Debug, Deserialize)]
pub struct WorkerQuery {
    worker: String,
}

fn inactive(run_id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Run {} is not active", run_id))
}

/// Rejects reports from anyone but the lease holder.
async fn check_holder(state: &AppState, run_id: Uuid, worker: &str) -> Result<(), ApiError> {
    match state.runner.lease_holder(run_id).await {
        None => Err(inactive(run_id)),
        Some(holder) if holder != worker => Err(ApiError::Forbidden(format!(
            "Run {} is not leased to {}",
            run_id, worker
        ))),
        Some(_) => Ok(()),
    }
}

pub async fn start(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<WorkerQuery>,
) -> Result<Json<Ack>, ApiError> {
    check_holder(&state, run_id, &query.worker).await?;
    if !state.runner.start_run(run_id).await? {
        return Err(inactive(run_id));
    }
    Ok(Json(Ack { run_id }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<WorkerQuery>,
) -> Result<Json<Ack>, ApiError> {
    check_holder(&state, run_id, &query.worker).await?;
    if !state.runner.heartbeat(run_id).await {
        return Err(inactive(run_id));
    }
    Ok(Json(Ack { run_id }))
}

pub async fn finish(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<WorkerQuery>,
    Json(report): Json<WorkerReport>,
) -> Result<Json<Run>, ApiError> {
    check_holder(&state, run_id, &query.worker).await?;
    state
        .runner
        .complete(run_id, report)
        .await?
        .map(Json)
        .ok_or_else(|| inactive(run_id))
}
