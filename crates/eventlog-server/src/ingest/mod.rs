//! Event log file ingestion
//!
//! # Architecture
//!
//! - **source**: Access to the remote platform (listing and content streams)
//! - **inventory**: Per-category file listing cached by half-day band
//! - **status**: Durable per-day status and row checkpoints with a cache
//! - **metrics**: Prometheus counters and label derivation
//! - **sink**: Destinations for exported rows
//! - **pipeline**: Two-pass, resumable processing of one file
//! - **coordinator**: Single job slot, triggers, polling and startup resume
//! - **clock**: Injectable local time

pub mod clock;
pub mod coordinator;
pub mod inventory;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CoordinatorError, JobCoordinator, PollStatus, RunHandle};
pub use inventory::{InventoryCache, InventoryError};
pub use metrics::{LabelTransformer, MetricsError, MetricsRecorder, MetricsRegistry};
pub use pipeline::{IngestionPipeline, PipelineError, PipelineSettings, RunOutcome, RunProgress};
pub use sink::{Destination, EventSink, RowContext, TracingEventSink};
pub use source::{AppLogStats, EventLogSource, LogFileReader, SourceError};
pub use status::{MemoryStatusStore, StatusCache, StatusSnapshot, StatusStore, StoreError};
