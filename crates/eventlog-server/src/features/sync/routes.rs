//! Sync routes
//!
//! - `POST /sync` starts a run for one category, or every category with `ALL`
//! - `POST /sync/yesterday` syncs every category of the previous day
//! - `GET /sync/status` polls the tracked run, `DELETE` forgets an outcome
//! - `POST /caches/clear` drops the inventory and status caches
//! - `GET /metadata` lists recent and persisted outcomes
//! - `GET /examine` counts the rows of one file

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Days;
use serde_json::json;

use super::queries::{metadata, SyncTarget, TargetQuery, TriggerQuery};
use crate::error::AppError;
use crate::features::FeatureState;
use crate::ingest::PollStatus;

/// Create sync routes
pub fn sync_routes() -> Router<FeatureState> {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route("/sync/yesterday", post(trigger_yesterday))
        .route("/sync/status", get(poll_status).delete(clear_status))
        .route("/caches/clear", post(clear_caches))
        .route("/metadata", get(get_metadata))
        .route("/examine", get(examine))
}

/// POST /sync?date=2025-03-16&category=ApexCallout
async fn trigger_sync(
    State(state): State<FeatureState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Response, AppError> {
    match SyncTarget::parse(&query.category)? {
        SyncTarget::All => {
            let statuses = state
                .coordinator
                .trigger_all(query.date, state.batch_timeout)
                .await;
            Ok((StatusCode::OK, Json(statuses)).into_response())
        },
        SyncTarget::One(category) => {
            let status = state
                .coordinator
                .trigger(query.date, category, query.resume_from.unwrap_or(1))
                .await?;
            Ok((StatusCode::OK, Json(status)).into_response())
        },
    }
}

/// POST /sync/yesterday
async fn trigger_yesterday(State(state): State<FeatureState>) -> Result<Response, AppError> {
    let yesterday = state
        .clock
        .today()
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| AppError::Internal("No date before today".to_string()))?;
    let statuses = state
        .coordinator
        .trigger_all(yesterday, state.batch_timeout)
        .await;
    Ok((StatusCode::OK, Json(statuses)).into_response())
}

/// GET /sync/status?date=2025-03-16&category=ApexCallout
async fn poll_status(
    State(state): State<FeatureState>,
    Query(query): Query<TargetQuery>,
) -> Result<Response, AppError> {
    let category = query.category()?;
    match state.coordinator.poll(query.date, category) {
        PollStatus::Complete { status } => Ok((StatusCode::OK, Json(status)).into_response()),
        PollStatus::InProgress { total: 0, .. } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Preparing transfer" })),
        )
            .into_response()),
        PollStatus::InProgress { processed, total } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": format!("{} of {}", processed, total) })),
        )
            .into_response()),
        PollStatus::Mismatch { tracked } => Err(AppError::Validation(match tracked {
            Some((date, category)) => format!("Tracking {} for {}, not the requested run", category, date),
            None => "No run has been tracked since startup".to_string(),
        })),
        PollStatus::Inconsistent => Err(AppError::Internal(
            "Job is idle without a result".to_string(),
        )),
    }
}

/// DELETE /sync/status?date=2025-03-16&category=ApexCallout
async fn clear_status(
    State(state): State<FeatureState>,
    Query(query): Query<TargetQuery>,
) -> Result<StatusCode, AppError> {
    let category = query.category()?;
    let removed = state.statuses.delete(query.date, category).await?;
    tracing::info!(date = %query.date, category = %category, removed, "Cleared sync status");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /caches/clear
async fn clear_caches(State(state): State<FeatureState>) -> StatusCode {
    state.inventory.clear().await;
    state.statuses.clear().await;
    StatusCode::NO_CONTENT
}

/// GET /metadata
async fn get_metadata(State(state): State<FeatureState>) -> Result<Response, AppError> {
    let response = metadata::handle(
        &state.coordinator,
        &state.statuses,
        &state.inventory,
        state.clock.today(),
    )
    .await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// GET /examine?date=2025-03-16&category=ApexCallout
async fn examine(
    State(state): State<FeatureState>,
    Query(query): Query<TargetQuery>,
) -> Result<Response, AppError> {
    let category = query.category()?;
    let rows = state
        .pipeline
        .examine(query.date, category)
        .await?
        .unwrap_or(0);
    Ok((StatusCode::OK, Json(json!({ "rows": rows }))).into_response())
}
