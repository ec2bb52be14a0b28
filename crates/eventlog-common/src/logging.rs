//! Logging Configuration and Initialization
//!
//! Every component logs through `tracing`. This module builds the subscriber:
//!
//! - Console, daily rolling file, or both
//! - Text or JSON format
//! - A separate **secure** destination for events that carry sensitive
//!   context (target [`SECURE_TARGET`]). Those events never reach the
//!   ordinary console or file layers.
//!
//! Exported event log rows are written with target [`EVENTS_TARGET`] to the
//! ordinary destinations and with [`SECURE_TARGET`] to the secure one.
//!
//! # Example
//!
//! ```no_run
//! use eventlog_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!
//!     info!("Application started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{
        self,
        format::{FmtSpan, Format, Json, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target of exported rows written with their public context
pub const EVENTS_TARGET: &str = "eventlog::events";

/// Target of exported rows written with their full context
pub const SECURE_TARGET: &str = "eventlog::secure";

/// Field of exported rows holding the time the platform recorded the event
pub const EVENT_TIME_FIELD: &str = "timestamp_derived";

/// JSON key keeping the write time of a row stamped with its event time
pub const WRITTEN_AT_KEY: &str = "timestampSfEventLog";

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

/// Output target for ordinary logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

/// Output target for the secure log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecureOutput {
    /// Secure events are dropped
    Off,
    /// Secure events go to stdout through their own layer
    Console,
    /// Secure events go to their own daily rolling file
    #[default]
    File,
}

impl std::str::FromStr for SecureOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(SecureOutput::Off),
            "console" | "stdout" => Ok(SecureOutput::Console),
            "file" => Ok(SecureOutput::File),
            _ => Err(anyhow::anyhow!("Invalid secure log output: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rolling log files
    pub log_dir: PathBuf,
    /// Prefix of the ordinary log files ("eventlog" -> "eventlog.2025-03-16")
    pub log_file_prefix: String,
    pub secure_output: SecureOutput,
    pub secure_file_prefix: String,
    /// Additional filter directives, e.g. "sqlx=warn,tower_http=debug"
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "eventlog".to_string(),
            secure_output: SecureOutput::File,
            secure_file_prefix: "secure".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Reads `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_SECURE_OUTPUT`, `LOG_SECURE_FILE_PREFIX`,
    /// `LOG_FILTER`, `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS` and
    /// `LOG_INCLUDE_TARGETS`.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply environment overrides to an existing configuration
    pub fn merge_env(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Ok(output) = std::env::var("LOG_SECURE_OUTPUT") {
            self.secure_output = output.parse()?;
        }
        if let Ok(prefix) = std::env::var("LOG_SECURE_FILE_PREFIX") {
            self.secure_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Ok(val) = std::env::var("LOG_INCLUDE_LOCATION") {
            self.include_location = val.parse().unwrap_or(false);
        }
        if let Ok(val) = std::env::var("LOG_INCLUDE_THREAD_IDS") {
            self.include_thread_ids = val.parse().unwrap_or(false);
        }
        if let Ok(val) = std::env::var("LOG_INCLUDE_TARGETS") {
            self.include_targets = val.parse().unwrap_or(true);
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn secure_output(mut self, output: SecureOutput) -> Self {
        self.config.secure_output = output;
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writers flushing. Hold it for the lifetime
/// of the process.
#[must_use]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Whether an event belongs to the secure destination
pub fn is_secure_target(target: &str) -> bool {
    target.starts_with(SECURE_TARGET)
}

fn is_secure(metadata: &Metadata<'_>) -> bool {
    is_secure_target(metadata.target())
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    let mut guards = Vec::new();
    let mut layers = Vec::new();

    if config.output.console() {
        layers.push(
            fmt_layer(config, std::io::stdout, true)
                .with_filter(filter_fn(|meta| !is_secure(meta)))
                .boxed(),
        );
    }

    if config.output.file() || config.secure_output == SecureOutput::File {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
    }

    if config.output.file() {
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(
            fmt_layer(config, writer, false)
                .with_filter(filter_fn(|meta| !is_secure(meta)))
                .boxed(),
        );
    }

    match config.secure_output {
        SecureOutput::Off => {},
        SecureOutput::Console => {
            layers.push(
                fmt_layer(config, std::io::stdout, true)
                    .with_filter(filter_fn(is_secure))
                    .boxed(),
            );
        },
        SecureOutput::File => {
            let appender =
                tracing_appender::rolling::daily(&config.log_dir, &config.secure_file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            layers.push(
                fmt_layer(config, writer, false)
                    .with_filter(filter_fn(is_secure))
                    .boxed(),
            );
        },
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _guards: guards })
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().event_format(EventTimeJson::new(config)).boxed(),
    }
}

/// JSON event format stamping exported rows with their event time
///
/// A row on [`EVENTS_TARGET`] or [`SECURE_TARGET`] that carries
/// [`EVENT_TIME_FIELD`] is written with that value as `timestamp`, and the
/// time of writing goes to [`WRITTEN_AT_KEY`]. Everything else is written by
/// the stock JSON format.
pub struct EventTimeJson {
    inner: Format<Json>,
    include_targets: bool,
}

impl EventTimeJson {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            inner: fmt::format()
                .json()
                .with_target(config.include_targets)
                .with_thread_ids(config.include_thread_ids)
                .with_file(config.include_location)
                .with_line_number(config.include_location),
            include_targets: config.include_targets,
        }
    }
}

impl<S, N> FormatEvent<S, N> for EventTimeJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let target = metadata.target();
        if target != EVENTS_TARGET && !is_secure_target(target) {
            return self.inner.format_event(ctx, writer, event);
        }

        let mut fields = JsonFieldVisitor::default();
        event.record(&mut fields);
        let Some(Value::String(event_time)) = fields.0.remove(EVENT_TIME_FIELD) else {
            return self.inner.format_event(ctx, writer, event);
        };

        let mut line = Map::new();
        line.insert("timestamp".to_string(), Value::String(event_time));
        line.insert(
            WRITTEN_AT_KEY.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        line.insert("level".to_string(), Value::String(metadata.level().to_string()));
        line.insert("fields".to_string(), Value::Object(fields.0));
        if self.include_targets {
            line.insert("target".to_string(), Value::String(target.to_string()));
        }

        let json = serde_json::to_string(&line).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonFieldVisitor(Map<String, Value>);

impl Visit for JsonFieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }
}
