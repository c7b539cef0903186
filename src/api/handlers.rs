//! Operator endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AuditEvent, ProposalStatus, PublishPolicy, PublishRecord, Run, RunKey};
use crate::publisher::PublishDecision;
use crate::queue::{QueueItem, QueueStats};
use crate::runner::WorkerLease;

use super::{ApiError, AppState};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    active: Vec<WorkerLease>,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active: state.runner.status().await,
    })
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    stats: QueueStats,
    items: Vec<QueueItem>,
}

/// Queue items in dispatch order.
pub async fn queue(State(state): State<AppState>) -> Result<Json<QueueResponse>, ApiError> {
    let stats = state.queue.stats(chrono::Utc::now()).await?;
    let items = state.queue.list().await?;
    Ok(Json(QueueResponse { stats, items }))
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: Run,
    pub publish: Option<PublishRecord>,
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    let publish = state.store.get_publish_record(id).await?;
    Ok(Json(RunResponse { run, publish }))
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    target: Option<String>,
    suite: Option<String>,
    limit: Option<usize>,
}

/// Run history, newest first; restricted to one key when both `target`
/// and `suite` are given.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let key = match (query.target, query.suite) {
        (Some(target), Some(suite)) => Some(RunKey::new(target, suite)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "target and suite must be given together".to_string(),
            ))
        }
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.store.list_runs(key.as_ref(), limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    reason: Option<String>,
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<Run>, ApiError> {
    let reason = query
        .reason
        .unwrap_or_else(|| "cancelled by operator".to_string());
    Ok(Json(state.runner.cancel(id, &reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    target: String,
    suite: String,
    #[serde(default)]
    context: serde_json::Value,
    #[serde(default)]
    maintainer: Option<String>,
    #[serde(default)]
    requestor: Option<String>,
}

/// Enqueues a manual item at top priority.
pub async fn reschedule(
    State(state): State<AppState>,
    Json(request): Json<RescheduleRequest>,
) -> Result<(StatusCode, Json<QueueItem>), ApiError> {
    let key = RunKey::new(request.target, request.suite);
    let requestor = request.requestor.unwrap_or_else(|| "api".to_string());
    let item = state
        .scheduler
        .reschedule(key.clone(), request.maintainer, request.context, &requestor)
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("{} is already in flight", key)))?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    run_id: Option<Uuid>,
    limit: Option<usize>,
}

pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.store.list_events(query.run_id, limit).await?))
}

pub async fn policies(
    State(state): State<AppState>,
) -> Result<Json<Vec<PublishPolicy>>, ApiError> {
    Ok(Json(state.store.list_policies().await?))
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    /// `null` clears the override.
    max_open: Option<u32>,
}

pub async fn set_policy(
    State(state): State<AppState>,
    Path(maintainer): Path<String>,
    Json(request): Json<PolicyRequest>,
) -> Result<Json<PublishPolicy>, ApiError> {
    let policy = state
        .store
        .set_max_open(&maintainer, request.max_open)
        .await?;
    tracing::info!(maintainer = %maintainer, max_open = ?request.max_open, "Publish limit updated");
    Ok(Json(policy))
}

pub async fn publish(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<PublishDecision>, ApiError> {
    Ok(Json(state.publisher.publish_run(run_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ProposalStatusRequest {
    proposal_id: String,
    status: ProposalStatus,
}

#[derive(Debug, Serialize)]
pub struct ProposalStatusResponse {
    changed: bool,
}

pub async fn proposal_status(
    State(state): State<AppState>,
    Json(request): Json<ProposalStatusRequest>,
) -> Result<Json<ProposalStatusResponse>, ApiError> {
    let changed = state
        .publisher
        .report_proposal_status(&request.proposal_id, request.status)
        .await?;
    Ok(Json(ProposalStatusResponse { changed }))
}
