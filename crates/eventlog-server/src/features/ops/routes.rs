//! Health, metrics, limits and application log routes

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crate::db;
use crate::error::AppError;
use crate::features::FeatureState;
use crate::salesforce::record_limits;

/// Content type of the Prometheus text exposition format
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn ops_routes() -> Router<FeatureState> {
    Router::new()
        .route("/is-alive", get(is_alive))
        .route("/is-ready", get(is_ready))
        .route("/metrics", get(metrics))
        .route("/limits", get(limits))
        .route("/applog-stats", get(application_log_stats))
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: NaiveDate,
}

async fn is_alive() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn is_ready(State(state): State<FeatureState>) -> Response {
    let Some(pool) = state.db.as_ref() else {
        return (StatusCode::OK, Json(json!({ "status": "ready", "database": "none" })))
            .into_response();
    };

    match db::health_check(pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "database": "connected" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "database": "disconnected" })),
            )
                .into_response()
        },
    }
}

async fn metrics(State(state): State<FeatureState>) -> Result<Response, AppError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response())
}

async fn limits(State(state): State<FeatureState>) -> Result<Response, AppError> {
    let limits = state.source.org_limits().await?;
    record_limits(&state.metrics, &limits);
    Ok((StatusCode::OK, Json(limits)).into_response())
}

/// GET /applog-stats?date=2025-03-16
async fn application_log_stats(
    State(state): State<FeatureState>,
    Query(query): Query<DateQuery>,
) -> Result<Response, AppError> {
    let stats = state.source.application_log_stats(query.date).await?;
    Ok((StatusCode::OK, Json(stats)).into_response())
}
