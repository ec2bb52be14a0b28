//! Service wiring and the HTTP application

use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;

use crate::config::SyncConfig;
use crate::features::{self, FeatureState};
use crate::ingest::{
    Clock, EventLogSource, EventSink, IngestionPipeline, InventoryCache, JobCoordinator,
    LabelTransformer, MetricsError, MetricsRecorder, MetricsRegistry, PipelineSettings,
    StatusCache, StatusStore,
};
use crate::middleware;

/// Path prefix of every route
pub const ROUTE_PREFIX: &str = "/internal";

/// Externally constructed collaborators
pub struct Components {
    pub source: Arc<dyn EventLogSource>,
    pub store: Arc<dyn StatusStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

impl SyncConfig {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            heartbeat_rows: self.heartbeat_rows,
            emit_pause: Duration::from_millis(self.emit_pause_ms),
            light_pause: Duration::from_millis(self.light_pause_ms),
            inspect_unmapped: self.local,
        }
    }
}

/// Build caches, pipeline and coordinator around the components
pub fn assemble(
    components: Components,
    sync: &SyncConfig,
    db: Option<PgPool>,
) -> Result<FeatureState, MetricsError> {
    let Components {
        source,
        store,
        metrics,
        sink,
        clock,
    } = components;

    let inventory = Arc::new(
        InventoryCache::new(Arc::clone(&source), Arc::clone(&clock))
            .with_caching(sync.inventory_cache),
    );
    let statuses = Arc::new(StatusCache::new(store, Arc::clone(&clock)));
    let recorder: Arc<dyn MetricsRecorder> = metrics.clone();

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&inventory),
        Arc::clone(&source),
        Arc::clone(&statuses),
        Arc::clone(&recorder),
        sink,
        Arc::clone(&clock),
        LabelTransformer::new()?,
        sync.pipeline_settings(),
    ));

    let coordinator = JobCoordinator::new(
        Arc::clone(&pipeline),
        Arc::clone(&statuses),
        Arc::clone(&inventory),
        recorder,
        Arc::clone(&clock),
    );

    Ok(FeatureState {
        coordinator,
        pipeline,
        statuses,
        inventory,
        metrics,
        source,
        clock,
        batch_timeout: sync.batch_timeout(),
        db,
    })
}

/// Router with all routes under [`ROUTE_PREFIX`] and the middleware stack
pub fn create_app(state: FeatureState) -> Router {
    Router::new()
        .nest(ROUTE_PREFIX, features::router(state))
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
}
