//! Remote event log platform seen from the ingestion engine

use async_trait::async_trait;
use chrono::NaiveDate;
use eventlog_common::{Category, FileLocator};
use serde::Serialize;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Non-seekable stream of one export file's CSV content
pub type LogFileReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not supported by this source: {0}")]
    Unsupported(&'static str),
}

/// Critical and Error application log records created on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppLogStats {
    pub date: NaiveDate,
    pub error: u64,
    pub critical: u64,
    /// False when paging stopped early and the counts are partial
    pub complete: bool,
}

/// Listing and content access for daily export files
#[async_trait]
pub trait EventLogSource: Send + Sync {
    /// Every file the platform lists for `category`.
    ///
    /// A failure while paging is logged and ends the listing early. The files
    /// collected up to that point are still returned.
    async fn list_log_files(&self, category: Category) -> Vec<FileLocator>;

    /// Open the content of one file. Every call starts a fresh stream.
    async fn open_log_file(&self, locator: &FileLocator) -> Result<LogFileReader, SourceError>;

    /// Raw org limits document of the platform
    async fn org_limits(&self) -> Result<serde_json::Value, SourceError> {
        Err(SourceError::Unsupported("org limits"))
    }

    /// Count the day's Critical and Error application log records
    async fn application_log_stats(&self, _date: NaiveDate) -> Result<AppLogStats, SourceError> {
        Err(SourceError::Unsupported("application log stats"))
    }
}
