//! Event Log Sync Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Daily ingestion of Salesforce `EventLogFile` exports into logs and
//! Prometheus metrics.
//!
//! # Overview
//!
//! - **Ingestion**: resumable two-pass processing of one export file per
//!   (day, category), driven by a single-slot job coordinator
//! - **Salesforce**: OAuth2 token handling, paged listing and streamed content
//! - **Persistence**: per-day outcomes and row checkpoints in PostgreSQL
//! - **API**: internal HTTP routes for triggers, polling, metadata and health checks
//!
//! # Example
//!
//! ```no_run
//! use eventlog_server::{app, config::Config};
//!
//! # fn build(components: app::Components) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let state = app::assemble(components, &config.sync, None)?;
//! let router = app::create_app(state);
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;
pub mod salesforce;

// Re-export commonly used types
pub use error::AppError;
