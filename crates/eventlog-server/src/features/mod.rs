//! Feature modules implementing the internal API
//!
//! # Features
//!
//! - **sync**: triggers, progress polls, status clearing, metadata and examine
//! - **ops**: liveness, readiness, Prometheus exposition and org limits
//!
//! Every route is mounted under `/internal` by [`crate::app::create_app`].

pub mod ops;
pub mod sync;

use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::ingest::{
    Clock, EventLogSource, IngestionPipeline, InventoryCache, JobCoordinator, MetricsRegistry,
    StatusCache,
};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub coordinator: Arc<JobCoordinator>,
    pub pipeline: Arc<IngestionPipeline>,
    pub statuses: Arc<StatusCache>,
    pub inventory: Arc<InventoryCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub source: Arc<dyn EventLogSource>,
    pub clock: Arc<dyn Clock>,
    /// Bound on waiting for each run of an ALL trigger
    pub batch_timeout: Duration,
    /// Checked by the readiness route. Absent in local mode.
    pub db: Option<PgPool>,
}

/// Creates the router with all feature routes
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .merge(ops::ops_routes())
        .merge(sync::sync_routes())
        .with_state(state)
}
