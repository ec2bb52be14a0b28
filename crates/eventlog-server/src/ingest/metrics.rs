//! Metric counters fed by exported rows
//!
//! Categories with metric label fields get one labeled counter each. Raw field
//! values are turned into bounded label values first. URLs lose their query
//! string and variable path segments. Durations and sizes collapse into fixed
//! human readable ranges.

use eventlog_common::category::LabelTransform;
use eventlog_common::{Category, CategoryDescriptor};
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Host whose paths carry webhook secrets and are never split out
const SLACK_HOOKS_HOST: &str = "hooks.slack.com";

/// Label used when a bucketed field is not a number
pub const NOT_APPLICABLE: &str = "Not applicable";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No counter registered for {0}")]
    UnknownCounter(Category),

    #[error("Field {0} is missing")]
    MissingField(&'static str),

    #[error("Field {field} value {value:?} is too short for a date label")]
    ShortDateLabel { field: &'static str, value: String },

    #[error("Cannot parse URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Counter sink consumed by the ingestion pipeline
pub trait MetricsRecorder: Send + Sync {
    /// Increment the category counter for one row
    fn increment(&self, category: Category, labels: &[String]) -> Result<(), MetricsError>;

    /// Drop every label combination of the category counter
    fn reset(&self, category: Category);

    /// Count files returned by a listing
    fn record_fetched(&self, _category: Category, _files: usize) {}
}

/// Prometheus backed recorder and exporter
pub struct MetricsRegistry {
    registry: Registry,
    counters: HashMap<Category, IntCounterVec>,
    fetched_logs: IntCounterVec,
    limit_max: GaugeVec,
    limit_remaining: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let mut counters = HashMap::new();
        for category in Category::ALL {
            let descriptor = category.descriptor();
            if !descriptor.records_metrics() {
                continue;
            }
            let counter = IntCounterVec::new(
                Opts::new(descriptor.name, format!("Rows of {} log files", descriptor.name)),
                &descriptor.metric_label_names(),
            )?;
            registry.register(Box::new(counter.clone()))?;
            counters.insert(category, counter);
        }

        let fetched_logs = IntCounterVec::new(
            Opts::new("fetched_logs", "Log files returned by the listing API"),
            &["event_type"],
        )?;
        registry.register(Box::new(fetched_logs.clone()))?;

        let limit_max = GaugeVec::new(Opts::new("sf_limit_max", "Org limit maximum"), &["limit"])?;
        registry.register(Box::new(limit_max.clone()))?;

        let limit_remaining = GaugeVec::new(
            Opts::new("sf_limit_remaining", "Org limit remaining"),
            &["limit"],
        )?;
        registry.register(Box::new(limit_remaining.clone()))?;

        Ok(Self {
            registry,
            counters,
            fetched_logs,
            limit_max,
            limit_remaining,
        })
    }

    pub fn set_limit(&self, limit: &str, max: f64, remaining: f64) {
        self.limit_max.with_label_values(&[limit]).set(max);
        self.limit_remaining.with_label_values(&[limit]).set(remaining);
    }

    /// Current value of one category counter series
    pub fn counter_value(&self, category: Category, labels: &[&str]) -> Option<u64> {
        self.counters
            .get(&category)?
            .get_metric_with_label_values(labels)
            .ok()
            .map(|counter| counter.get())
    }

    pub fn fetched_value(&self, category: Category) -> u64 {
        self.fetched_logs.with_label_values(&[category.name()]).get()
    }

    /// Everything registered, in the Prometheus text format
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

impl MetricsRecorder for MetricsRegistry {
    fn increment(&self, category: Category, labels: &[String]) -> Result<(), MetricsError> {
        let counter = self
            .counters
            .get(&category)
            .ok_or(MetricsError::UnknownCounter(category))?;
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        counter.get_metric_with_label_values(&labels)?.inc();
        Ok(())
    }

    fn reset(&self, category: Category) {
        if let Some(counter) = self.counters.get(&category) {
            counter.reset();
        }
    }

    fn record_fetched(&self, category: Category, files: usize) {
        self.fetched_logs
            .with_label_values(&[category.name()])
            .inc_by(files as u64);
    }
}

/// Turns raw row values into metric label values
pub struct LabelTransformer {
    leading_digits: Regex,
    identifier: Regex,
    filename: Regex,
    code: Regex,
}

impl LabelTransformer {
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            leading_digits: Regex::new(r"^\d+")?,
            identifier: Regex::new(r"^[A-Z]\d{4,}")?,
            filename: Regex::new(r"^[^/]+\.(xml|pdf)$")?,
            code: Regex::new(r"^[A-Z]{3}$")?,
        })
    }

    /// Ordered label values for one row, date label last
    pub fn labels(
        &self,
        descriptor: &CategoryDescriptor,
        fields: &HashMap<String, String>,
    ) -> Result<Vec<String>, MetricsError> {
        let mut labels = Vec::with_capacity(descriptor.metric_labels.len() + 1);
        for field in descriptor.metric_labels {
            let raw = fields.get(*field).map(String::as_str).unwrap_or_default();
            let value = match descriptor.label_transform(field) {
                LabelTransform::Raw => raw.to_string(),
                LabelTransform::NormalizeUrl => self.normalize_url(raw)?,
                LabelTransform::DurationBucket => raw
                    .parse::<i64>()
                    .map(duration_label)
                    .unwrap_or(NOT_APPLICABLE)
                    .to_string(),
                LabelTransform::SizeBucket => raw
                    .parse::<i64>()
                    .map(size_label)
                    .unwrap_or(NOT_APPLICABLE)
                    .to_string(),
            };
            labels.push(value);
        }

        let date_field = descriptor
            .metric_date_field
            .ok_or(MetricsError::MissingField("metric date field"))?;
        let date_value = fields
            .get(date_field)
            .ok_or(MetricsError::MissingField(date_field))?;
        let date_label = date_value
            .get(..10)
            .ok_or_else(|| MetricsError::ShortDateLabel {
                field: date_field,
                value: date_value.clone(),
            })?;
        labels.push(date_label.to_string());

        Ok(labels)
    }

    /// Collapse a URL into a low cardinality label
    pub fn normalize_url(&self, raw: &str) -> Result<String, MetricsError> {
        let without_query = raw.split(['?', '#']).next().unwrap_or_default();

        if without_query.starts_with("http") {
            let url = Url::parse(without_query).map_err(|source| MetricsError::InvalidUrl {
                url: without_query.to_string(),
                source,
            })?;
            let host = url.host_str().unwrap_or_default();
            if host == SLACK_HOOKS_HOST {
                return Ok(host.to_string());
            }
            let path = match url.path() {
                "/" => "",
                path => path,
            };
            Ok(format!("{host}{}", self.mask_path(path)))
        } else if let Some(rest) = without_query.strip_prefix("callout:") {
            Ok(format!("callout:{}", self.mask_path(rest)))
        } else {
            Ok(without_query.to_string())
        }
    }

    /// Replace variable path segments with fixed placeholders
    pub fn mask_path(&self, path: &str) -> String {
        let segments: Vec<&str> = path.split('/').collect();
        let last = segments.len().saturating_sub(1);
        segments
            .iter()
            .enumerate()
            // The first piece precedes the first slash and is never a segment
            .map(|(index, segment)| {
                if index == 0 {
                    segment.to_string()
                } else {
                    self.mask_segment(segment, index == last)
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn mask_segment(&self, segment: &str, is_last: bool) -> String {
        let segment = self.leading_digits.replace(segment, "{id}");
        let segment = self.identifier.replace(&segment, "{ident}");
        if is_last && self.filename.is_match(&segment) {
            return "{filename}".to_string();
        }
        if self.code.is_match(&segment) {
            return "{code}".to_string();
        }
        segment.into_owned()
    }
}

/// Bucket a duration in milliseconds
pub fn duration_label(millis: i64) -> &'static str {
    match millis {
        m if m < 10 => "< 10 ms",
        m if m < 50 => "< 50 ms",
        m if m < 100 => "< 100 ms",
        m if m < 500 => "< 500 ms",
        m if m < 1_000 => "< 1s",
        m if m < 5_000 => "< 5s",
        m if m < 10_000 => "< 10s",
        _ => "> 10s",
    }
}

/// Bucket a size in bytes
pub fn size_label(bytes: i64) -> &'static str {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    match bytes {
        b if b < KB => "< 1 KB",
        b if b < 10 * KB => "< 10 KB",
        b if b < 100 * KB => "< 100 KB",
        b if b < MB => "< 1 MB",
        b if b < 10 * MB => "< 10 MB",
        _ => "> 10 MB",
    }
}
