//! Two-pass ingestion of one daily export file
//!
//! The content stream cannot seek and does not announce its length, so a run
//! reads the file twice. The first pass only counts data rows so progress can
//! be reported against a known total. The second pass processes the rows,
//! checkpointing after each one so an interrupted run can be resumed.
//!
//! The two passes are not reconciled. If the remote file changes between
//! them, the run completes against the row count of the first pass.

use chrono::NaiveDate;
use csv_async::{AsyncReaderBuilder, ByteRecord, ErrorKind};
use eventlog_common::{Category, CategoryDescriptor, Checkpoint, FileLocator, SyncState, SyncStatus};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::clock::Clock;
use super::inventory::{InventoryCache, InventoryError};
use super::metrics::{LabelTransformer, MetricsRecorder};
use super::sink::{Destination, EventSink, RowContext};
use super::source::{EventLogSource, LogFileReader, SourceError};
use super::status::{StatusCache, StoreError};

/// Placeholder for context fields absent from a row
const MISSING: &str = "N/A";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Short classification used in failure messages
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Inventory(_) => "InventoryInconsistency",
            PipelineError::Source(SourceError::Status { .. }) => "HttpStatusError",
            PipelineError::Source(SourceError::Unsupported(_)) => "UnsupportedOperation",
            PipelineError::Source(_) => "TransportError",
            PipelineError::Csv(e) if matches!(e.kind(), ErrorKind::Io(_)) => "TransportError",
            PipelineError::Csv(_) => "CsvError",
            PipelineError::Store(_) => "StoreError",
        }
    }
}

/// Row counters of the active run, shared with pollers
#[derive(Debug, Default)]
pub struct RunProgress {
    processed: AtomicU64,
    total: AtomicU64,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// (rows processed, rows total). A zero total means counting is not done.
    pub fn snapshot(&self) -> (u64, u64) {
        // Total first: it is published after the resume offset
        let total = self.total.load(Ordering::Acquire);
        (self.processed.load(Ordering::Acquire), total)
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Release);
        self.total.store(0, Ordering::Release);
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    fn set_processed(&self, row: u64) {
        self.processed.store(row, Ordering::Release);
    }
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The platform has no file for the day. Nothing is persisted.
    NoFile(SyncStatus),
    Success(SyncStatus),
    Failure(SyncStatus),
}

impl RunOutcome {
    pub fn status(&self) -> &SyncStatus {
        match self {
            RunOutcome::NoFile(status) | RunOutcome::Success(status) | RunOutcome::Failure(status) => {
                status
            },
        }
    }

    pub fn into_status(self) -> SyncStatus {
        match self {
            RunOutcome::NoFile(status) | RunOutcome::Success(status) | RunOutcome::Failure(status) => {
                status
            },
        }
    }
}

/// Pacing and emission settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Rows between heartbeat log lines and pauses
    pub heartbeat_rows: u64,
    /// Pause after a block of rows that produced log output
    pub emit_pause: Duration,
    /// Pause after a block of skipped or metrics-only rows
    pub light_pause: Duration,
    /// Emit whole rows of categories without message and metric fields
    pub inspect_unmapped: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            heartbeat_rows: 100,
            emit_pause: Duration::from_millis(2000),
            light_pause: Duration::from_millis(20),
            inspect_unmapped: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunSummary {
    total: u64,
    skipped: u64,
}

pub struct IngestionPipeline {
    inventory: Arc<InventoryCache>,
    source: Arc<dyn EventLogSource>,
    statuses: Arc<StatusCache>,
    metrics: Arc<dyn MetricsRecorder>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    labels: LabelTransformer,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: Arc<InventoryCache>,
        source: Arc<dyn EventLogSource>,
        statuses: Arc<StatusCache>,
        metrics: Arc<dyn MetricsRecorder>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        labels: LabelTransformer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inventory,
            source,
            statuses,
            metrics,
            sink,
            clock,
            labels,
            settings,
        }
    }

    /// Ingest the file of (date, category), skipping rows before `resume_from`
    pub async fn run(
        &self,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
        progress: &RunProgress,
    ) -> RunOutcome {
        let lookup = self.inventory.resolve(date, category).await;
        self.run_resolved(date, category, lookup, resume_from, progress)
            .await
    }

    /// Like [`run`](Self::run) with the file lookup already done by the caller
    #[instrument(skip(self, lookup, progress), fields(category = %category, date = %date))]
    pub async fn run_resolved(
        &self,
        date: NaiveDate,
        category: Category,
        lookup: Result<Option<FileLocator>, InventoryError>,
        resume_from: u64,
        progress: &RunProgress,
    ) -> RunOutcome {
        let resume_from = resume_from.max(1);

        let error = match self.execute(lookup, resume_from, progress).await {
            Ok(None) => {
                info!("No log file available");
                return RunOutcome::NoFile(SyncStatus::no_file(date, category, self.clock.today()));
            },
            Ok(Some(summary)) => match self.complete(date, category, summary).await {
                Ok(status) => return RunOutcome::Success(status),
                Err(e) => e,
            },
            Err(e) => e,
        };

        warn!(kind = error.kind(), error = %error, "Run failed");
        let failure = SyncStatus::new(
            date,
            category,
            SyncState::Failure,
            format!("{}: {}", error.kind(), error),
        );
        match self.statuses.record(&failure).await {
            Ok(stored) => RunOutcome::Failure(stored),
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist failure status");
                RunOutcome::Failure(failure)
            },
        }
    }

    /// Count the data rows of (date, category) without processing them
    pub async fn examine(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<Option<u64>, PipelineError> {
        match self.inventory.resolve(date, category).await? {
            Some(locator) => Ok(Some(self.count_rows(&locator).await?)),
            None => Ok(None),
        }
    }

    async fn execute(
        &self,
        lookup: Result<Option<FileLocator>, InventoryError>,
        resume_from: u64,
        progress: &RunProgress,
    ) -> Result<Option<RunSummary>, PipelineError> {
        let Some(locator) = lookup? else {
            return Ok(None);
        };
        let (date, category) = (locator.log_date, locator.category);

        let total = self.count_rows(&locator).await?;
        progress.set_processed(resume_from - 1);
        progress.set_total(total);
        if resume_from > 1 {
            info!(total, resume_from, "Continuing run");
        } else {
            info!(total, "Starting run");
        }

        let checkpoint = |row| Checkpoint {
            sync_date: date,
            category,
            row,
            rows_total: total,
        };
        if resume_from == 1 {
            // Marks the run as started so a crash before the first row is resumed
            self.statuses.store().upsert_checkpoint(&checkpoint(0)).await?;
        }

        let descriptor = category.descriptor();
        let mut reader = csv_reader(self.source.open_log_file(&locator).await?);
        let headers: Vec<String> = reader
            .byte_headers()
            .await?
            .iter()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();
        let mut records = reader.byte_records();

        let mut row: u64 = 0;
        while let Some(record) = records.next().await {
            let record = record?;
            row += 1;

            let processed = row >= resume_from;
            if processed {
                self.process_row(category, &headers, &record, row, total);
                self.statuses
                    .store()
                    .upsert_checkpoint(&checkpoint(row))
                    .await?;
                progress.set_processed(row);
            }

            if row % self.settings.heartbeat_rows.max(1) == 0 {
                self.heartbeat(descriptor, row, total, processed).await;
            }
        }

        info!(rows = row, total, "Finished reading log file");
        Ok(Some(RunSummary {
            total,
            skipped: (resume_from - 1).min(row),
        }))
    }

    async fn complete(
        &self,
        date: NaiveDate,
        category: Category,
        summary: RunSummary,
    ) -> Result<SyncStatus, PipelineError> {
        let mut message = format!(
            "Processed {} events of type {} for {}",
            summary.total, category, date
        );
        if summary.skipped > 0 {
            message.push_str(&format!(
                " (pickup from {} in current run, skipped {})",
                summary.skipped + 1,
                summary.skipped
            ));
        }

        let status = self
            .statuses
            .record(&SyncStatus::new(date, category, SyncState::Success, message))
            .await?;

        if let Err(e) = self.statuses.store().delete_checkpoint(date, category).await {
            warn!(error = %e, "Failed to clear checkpoint after successful run");
        }
        info!(message = %status.message, "Run succeeded");
        Ok(status)
    }

    async fn count_rows(&self, locator: &FileLocator) -> Result<u64, PipelineError> {
        let mut reader = csv_reader(self.source.open_log_file(locator).await?);
        let mut records = reader.byte_records();
        let mut count = 0;
        while let Some(record) = records.next().await {
            record?;
            count += 1;
        }
        Ok(count)
    }

    fn process_row(
        &self,
        category: Category,
        headers: &[String],
        record: &ByteRecord,
        row: u64,
        total: u64,
    ) {
        let descriptor = category.descriptor();
        let fields = field_map(headers, record);

        let message = match descriptor.message_field {
            Some(field) => Some(fields.get(field).cloned().unwrap_or_else(|| MISSING.to_string())),
            None if self.settings.inspect_unmapped && descriptor.is_inspection() => {
                let sorted: BTreeMap<&String, &String> = fields.iter().collect();
                Some(serde_json::to_string(&sorted).unwrap_or_default())
            },
            None => None,
        };

        if let Some(message) = message {
            let public = row_context(descriptor, &fields, false, row, total);
            let full = row_context(descriptor, &fields, true, row, total);
            self.sink.emit(Destination::Public, &message, &public);
            self.sink.emit(Destination::Secure, &message, &full);
        }

        if descriptor.records_metrics() {
            let result = self
                .labels
                .labels(descriptor, &fields)
                .and_then(|labels| self.metrics.increment(category, &labels));
            if let Err(e) = result {
                warn!(row, error = %e, "Failed to populate and increment metric");
            }
        }
    }

    async fn heartbeat(&self, descriptor: &CategoryDescriptor, row: u64, total: u64, processed: bool) {
        let pause = if processed {
            info!(row, total, "Processed {} of {} events", row, total);
            if descriptor.emits_messages() && !self.settings.inspect_unmapped {
                self.settings.emit_pause
            } else {
                self.settings.light_pause
            }
        } else {
            info!(row, total, "Skipped {} of {} events", row, total);
            self.settings.light_pause
        };
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

fn csv_reader(reader: LogFileReader) -> csv_async::AsyncReader<LogFileReader> {
    AsyncReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .create_reader(reader)
}

/// Non-blank values of a row keyed by column name.
///
/// Invalid UTF-8 is replaced rather than rejected. Values keep their
/// surrounding whitespace and lose only stray quotes.
fn field_map(headers: &[String], record: &ByteRecord) -> HashMap<String, String> {
    headers
        .iter()
        .zip(record.iter())
        .filter_map(|(name, raw)| {
            let value = String::from_utf8_lossy(raw);
            let value = value.trim_matches('"');
            (!value.trim().is_empty()).then(|| (name.clone(), value.to_string()))
        })
        .collect()
}

fn row_context(
    descriptor: &CategoryDescriptor,
    fields: &HashMap<String, String>,
    include_sensitive: bool,
    row: u64,
    total: u64,
) -> RowContext {
    let sensitive: &[&str] = if include_sensitive {
        descriptor.sensitive_fields
    } else {
        &[]
    };

    let mut context: RowContext = descriptor
        .context_fields
        .iter()
        .chain(sensitive)
        .map(|field| {
            let value = fields.get(*field).cloned().unwrap_or_else(|| MISSING.to_string());
            (field.to_string(), value)
        })
        .collect();
    context.insert("event_type".to_string(), descriptor.name.to_string());
    context.insert("log_row".to_string(), row.to_string());
    context.insert("log_rows_total".to_string(), total.to_string());
    context
}
