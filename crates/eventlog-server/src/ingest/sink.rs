//! Destinations for exported rows
//!
//! Every emitted row goes twice: once with its public context and once with
//! the full context (sensitive fields included) to the secure destination.

use eventlog_common::logging::{EVENTS_TARGET, SECURE_TARGET};
use std::collections::BTreeMap;

/// Context attached to one emitted row
pub type RowContext = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Ordinary logs, sensitive fields removed
    Public,
    /// Secure logs, full context
    Secure,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, destination: Destination, message: &str, context: &RowContext);
}

/// Writes rows as `tracing` events
///
/// Public rows use target `eventlog::events`. Secure rows use
/// `eventlog::secure`, which only the secure log layer accepts. A row's
/// `TIMESTAMP_DERIVED` is passed as the event time field, so JSON logs are
/// stamped with when the event happened rather than when it was ingested.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, destination: Destination, message: &str, context: &RowContext) {
        let context_json = serde_json::to_string(context).unwrap_or_default();
        let field = |name: &str| context.get(name).map(String::as_str).unwrap_or("N/A");
        let event_type = field("event_type");
        let row = field("log_row");
        let rows_total = field("log_rows_total");
        let timestamp_derived = Some(field("TIMESTAMP_DERIVED")).filter(|value| *value != "N/A");
        match destination {
            Destination::Public => tracing::error!(
                target: EVENTS_TARGET,
                event_type,
                row,
                rows_total,
                timestamp_derived,
                context = %context_json,
                "{message}"
            ),
            Destination::Secure => tracing::error!(
                target: SECURE_TARGET,
                event_type,
                row,
                rows_total,
                timestamp_derived,
                context = %context_json,
                "{message}"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eventlog_common::logging::{EventTimeJson, LogConfig, LogFormat, WRITTEN_AT_KEY};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn emit_json(context: &RowContext) -> serde_json::Value {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let config = LogConfig::builder().format(LogFormat::Json).build();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || writer.clone())
                .json()
                .event_format(EventTimeJson::new(&config)),
        );
        tracing::subscriber::with_default(subscriber, || {
            TracingEventSink.emit(Destination::Public, "boom", context);
        });
        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        serde_json::from_str(output.trim()).unwrap()
    }

    fn context(timestamp: &str) -> RowContext {
        RowContext::from([
            ("event_type".to_string(), "ApexUnexpectedException".to_string()),
            ("log_row".to_string(), "3".to_string()),
            ("log_rows_total".to_string(), "10".to_string()),
            ("TIMESTAMP_DERIVED".to_string(), timestamp.to_string()),
        ])
    }

    #[test]
    fn test_row_is_stamped_with_event_time() {
        let line = emit_json(&context("2025-03-16T10:00:00.000Z"));
        assert_eq!(line["timestamp"], "2025-03-16T10:00:00.000Z");
        assert!(line.get(WRITTEN_AT_KEY).is_some());
        assert_eq!(line["fields"]["row"], "3");
        assert_eq!(line["fields"]["rows_total"], "10");
    }

    #[test]
    fn test_placeholder_event_time_is_not_used() {
        let line = emit_json(&context("N/A"));
        assert_ne!(line["timestamp"], "N/A");
        assert!(line.get(WRITTEN_AT_KEY).is_none());
    }
}
