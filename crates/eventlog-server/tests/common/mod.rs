//! Shared fakes for the integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use chrono::{NaiveDate, NaiveDateTime};
use eventlog_common::{Category, Checkpoint, FileLocator, SyncStatus};
use eventlog_server::app::{self, Components};
use eventlog_server::config::SyncConfig;
use eventlog_server::features::FeatureState;
use eventlog_server::ingest::{
    Destination, EventLogSource, EventSink, JobCoordinator, LogFileReader, ManualClock,
    MemoryStatusStore, MetricsRegistry, RowContext, SourceError, StatusStore, StoreError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::io::StreamReader;

pub const CALLOUT_HEADER: &str = "EVENT_TYPE,TIMESTAMP_DERIVED,REQUEST_ID,USER_ID_DERIVED,TYPE,METHOD,SUCCESS,STATUS_CODE,URL,TIME,REQUEST_SIZE,RESPONSE_SIZE";

pub const EXCEPTION_HEADER: &str = "EVENT_TYPE,TIMESTAMP,TIMESTAMP_DERIVED,REQUEST_ID,ORGANIZATION_ID,EXCEPTION_TYPE,EXCEPTION_CATEGORY,EXCEPTION_MESSAGE,STACK_TRACE,USER_ID,USER_ID_DERIVED";

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
}

pub fn at(d: u32, hour: u32, minute: u32) -> NaiveDateTime {
    day(d).and_hms_opt(hour, minute, 0).unwrap()
}

/// Callout export with `rows` identical GET rows of 2025-03-16
pub fn callout_csv(rows: usize) -> String {
    let mut csv = format!("{CALLOUT_HEADER}\n");
    for i in 0..rows {
        csv.push_str(&format!(
            "ApexCallout,2025-03-16T10:00:00.000Z,REQ{i},005USER,REST,GET,1,200,https://api.example.com/v1/orders/{}?page=2,42,10,2048\n",
            1000 + i
        ));
    }
    csv
}

/// Exception export with numbered messages "boom 1", "boom 2", ...
pub fn exception_csv(rows: usize) -> String {
    let mut csv = format!("{EXCEPTION_HEADER}\n");
    for i in 1..=rows {
        csv.push_str(&format!(
            "ApexUnexpectedException,20250316100000.000,2025-03-16T10:00:00.000Z,REQ{i},00DORG,System.NullPointerException,Apex,boom {i},Class.Foo.bar: line {i},005USER,005USERDERIVED\n"
        ));
    }
    csv
}

/// Labels of every row produced by [`callout_csv`]
pub fn callout_labels() -> Vec<&'static str> {
    vec![
        "REST",
        "GET",
        "1",
        "200",
        "api.example.com/v1/orders/{id}",
        "< 50 ms",
        "< 1 KB",
        "< 10 KB",
        "2025-03-16",
    ]
}

/// Content served for one open of a file
#[derive(Debug, Clone)]
pub struct Script {
    pub csv: Vec<u8>,
    /// Fail the stream after this many data rows
    pub fail_after_rows: Option<usize>,
    /// Stall the stream after this many data rows until [`FakeSource::unpause`]
    pub pause_after_rows: Option<usize>,
}

impl Script {
    pub fn ok(csv: String) -> Self {
        Self::bytes(csv.into_bytes())
    }

    pub fn bytes(csv: Vec<u8>) -> Self {
        Self {
            csv,
            fail_after_rows: None,
            pause_after_rows: None,
        }
    }

    pub fn failing(csv: String, rows: usize) -> Self {
        Self {
            fail_after_rows: Some(rows),
            ..Self::ok(csv)
        }
    }

    pub fn pausing(csv: String, rows: usize) -> Self {
        Self {
            pause_after_rows: Some(rows),
            ..Self::ok(csv)
        }
    }
}

/// Scripted [`EventLogSource`]
///
/// Each open pops the next script of the file, the last one repeats.
pub struct FakeSource {
    files: Mutex<HashMap<Category, Vec<FileLocator>>>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    pub list_calls: AtomicUsize,
    pub opens: AtomicUsize,
    hold: watch::Sender<bool>,
    paused: watch::Sender<bool>,
}

impl Default for FakeSource {
    fn default() -> Self {
        let (hold, _) = watch::channel(false);
        let (paused, _) = watch::channel(true);
        Self {
            files: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            hold,
            paused,
        }
    }
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a file and the scripts of its successive opens
    pub fn add_file(&self, category: Category, date: NaiveDate, scripts: Vec<Script>) -> FileLocator {
        let reference = format!("/services/data/v58.0/sobjects/EventLogFile/{category}-{date}/LogFile");
        let locator = FileLocator {
            category,
            log_date: date,
            reference: reference.clone(),
        };
        self.files
            .lock()
            .unwrap()
            .entry(category)
            .or_default()
            .push(locator.clone());
        self.scripts
            .lock()
            .unwrap()
            .insert(reference, scripts.into_iter().collect());
        locator
    }

    /// Make every open wait until [`FakeSource::release`]
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Let streams stalled by [`Script::pausing`] continue
    pub fn unpause(&self) {
        self.paused.send_replace(false);
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn next_script(&self, reference: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(reference)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// Header line plus the first `rows` data lines, and the remainder
fn split_rows(csv: &[u8], rows: usize) -> (Bytes, Bytes) {
    let end = csv
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'\n')
        .nth(rows)
        .map(|(i, _)| i + 1)
        .unwrap_or(csv.len());
    (
        Bytes::copy_from_slice(&csv[..end]),
        Bytes::copy_from_slice(&csv[end..]),
    )
}

fn script_reader(script: Script, mut paused: watch::Receiver<bool>) -> LogFileReader {
    if let Some(rows) = script.fail_after_rows {
        let (head, _) = split_rows(&script.csv, rows);
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(head),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
        ];
        return Box::pin(StreamReader::new(futures::stream::iter(chunks)));
    }

    if let Some(rows) = script.pause_after_rows {
        let (head, tail) = split_rows(&script.csv, rows);
        let rest = futures::stream::once(async move {
            let _ = paused.wait_for(|paused| !*paused).await;
            Ok::<_, std::io::Error>(tail)
        });
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(head)]).chain(rest);
        return Box::pin(StreamReader::new(Box::pin(stream)));
    }

    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(script.csv))];
    Box::pin(StreamReader::new(futures::stream::iter(chunks)))
}

#[async_trait]
impl EventLogSource for FakeSource {
    async fn list_log_files(&self, category: Category) -> Vec<FileLocator> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    async fn open_log_file(&self, locator: &FileLocator) -> Result<LogFileReader, SourceError> {
        let mut held = self.hold.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.next_script(&locator.reference).ok_or(SourceError::Status {
            status: 404,
            url: locator.reference.clone(),
        })?;
        Ok(script_reader(script, self.paused.subscribe()))
    }
}

/// In-memory store that also keeps every checkpoint write
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStatusStore,
    history: Mutex<Vec<Checkpoint>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_history(&self) -> Vec<Checkpoint> {
        self.history.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }
}

#[async_trait]
impl StatusStore for RecordingStore {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError> {
        self.inner.upsert_status(status).await
    }

    async fn load_statuses(&self) -> Result<Vec<SyncStatus>, StoreError> {
        self.inner.load_statuses().await
    }

    async fn delete_status(&self, date: NaiveDate, category: Category) -> Result<bool, StoreError> {
        self.inner.delete_status(date, category).await
    }

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.history.lock().unwrap().push(*checkpoint);
        self.inner.upsert_checkpoint(checkpoint).await
    }

    async fn delete_checkpoint(&self, date: NaiveDate, category: Category) -> Result<(), StoreError> {
        self.inner.delete_checkpoint(date, category).await
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.load_checkpoints().await
    }
}

/// Sink keeping every emitted row
#[derive(Default)]
pub struct CapturingSink {
    rows: Mutex<Vec<(Destination, String, RowContext)>>,
}

impl CapturingSink {
    pub fn rows(&self) -> Vec<(Destination, String, RowContext)> {
        self.rows.lock().unwrap().clone()
    }

    pub fn messages(&self, destination: Destination) -> Vec<String> {
        self.rows()
            .into_iter()
            .filter(|(d, _, _)| *d == destination)
            .map(|(_, message, _)| message)
            .collect()
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, destination: Destination, message: &str, context: &RowContext) {
        self.rows
            .lock()
            .unwrap()
            .push((destination, message.to_string(), context.clone()));
    }
}

/// Fully wired service over fakes
pub struct Harness {
    pub source: Arc<FakeSource>,
    pub store: Arc<RecordingStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub sink: Arc<CapturingSink>,
    pub clock: ManualClock,
    pub state: FeatureState,
}

/// Sync settings without pauses
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        emit_pause_ms: 0,
        light_pause_ms: 0,
        limits_poll_secs: 0,
        batch_timeout_secs: 30,
        ..SyncConfig::default()
    }
}

impl Harness {
    /// Service clock at 2025-03-17 09:00, morning band
    pub fn new() -> Self {
        Self::with_config(fast_sync_config())
    }

    pub fn with_config(sync: SyncConfig) -> Self {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(RecordingStore::new());
        Self::with_parts(sync, source, store)
    }

    pub fn with_parts(sync: SyncConfig, source: Arc<FakeSource>, store: Arc<RecordingStore>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let sink = Arc::new(CapturingSink::default());
        let clock = ManualClock::new(at(17, 9, 0));

        let state = app::assemble(
            Components {
                source: source.clone(),
                store: store.clone(),
                metrics: metrics.clone(),
                sink: sink.clone(),
                clock: Arc::new(clock.clone()),
            },
            &sync,
            None,
        )
        .unwrap();

        Self {
            source,
            store,
            metrics,
            sink,
            clock,
            state,
        }
    }
}

/// Wait for the job slot to be released
pub async fn wait_until_idle(coordinator: &JobCoordinator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run did not finish in time");
}

/// Wait for a persisted status of (date, category)
pub async fn wait_for_status(harness: &Harness, date: NaiveDate, category: Category) -> SyncStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = harness.state.statuses.get(date, category).await.unwrap() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no status persisted in time")
}
