//! Event Log Sync Server - Main entry point

use anyhow::{Context, Result};
use eventlog_common::logging::{init_logging, LogConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use eventlog_server::{
    app::{self, Components},
    config::Config,
    db::{self, PgStatusStore},
    ingest::{
        EventLogSource, JobCoordinator, MemoryStatusStore, MetricsRegistry, StatusStore,
        SystemClock, TracingEventSink,
    },
    salesforce::{
        record_limits, AccessTokenProvider, ClientCredentialsTokenProvider, SalesforceClient,
        StaticTokenProvider,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("eventlog-server")
        .filter_directives("eventlog_server=info,tower_http=info,sqlx=warn")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting event log sync server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let metrics = Arc::new(MetricsRegistry::new()?);

    let tokens: Arc<dyn AccessTokenProvider> = if config.salesforce.uses_client_credentials() {
        Arc::new(ClientCredentialsTokenProvider::new(&config.salesforce)?)
    } else {
        info!("Using static Salesforce access token");
        Arc::new(StaticTokenProvider::new(
            config.salesforce.access_token.clone().unwrap_or_default(),
            config.salesforce.instance_url.clone().unwrap_or_default(),
        ))
    };
    let source: Arc<dyn EventLogSource> = Arc::new(SalesforceClient::new(
        &config.salesforce,
        tokens,
        metrics.clone(),
    )?);

    let (store, pool) = if config.sync.local {
        info!("Local mode, sync statuses are kept in memory");
        let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());
        (store, None)
    } else {
        let pool = db::create_pool(&config.database)
            .await
            .context("Failed to connect to database")?;
        db::migrate(&pool).await?;
        let store: Arc<dyn StatusStore> = Arc::new(PgStatusStore::new(pool.clone()));
        (store, Some(pool))
    };

    let state = app::assemble(
        Components {
            source: Arc::clone(&source),
            store,
            metrics: Arc::clone(&metrics),
            sink: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        },
        &config.sync,
        pool,
    )?;

    if config.sync.resume_on_startup {
        resume_interrupted(&state.coordinator, config.sync.batch_timeout()).await;
    }

    if config.sync.limits_poll_secs > 0 {
        spawn_limits_poll(
            source,
            metrics,
            Duration::from_secs(config.sync.limits_poll_secs),
        );
    }

    let app = app::create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

async fn resume_interrupted(coordinator: &Arc<JobCoordinator>, timeout: Duration) {
    match coordinator.resume_interrupted(timeout).await {
        Ok(0) => info!("No interrupted syncs to resume"),
        Ok(scheduled) => info!(scheduled, "Resuming interrupted syncs in the background"),
        Err(e) => error!(error = %e, "Failed to load checkpoints, skipping resume"),
    }
}

fn spawn_limits_poll(
    source: Arc<dyn EventLogSource>,
    metrics: Arc<MetricsRegistry>,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match source.org_limits().await {
                Ok(limits) => {
                    record_limits(&metrics, &limits);
                },
                Err(e) => warn!(error = %e, "Failed to fetch org limits"),
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
