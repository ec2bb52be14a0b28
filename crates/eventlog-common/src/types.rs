//! Common types used across event log sync

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::category::Category;
use crate::error::EventLogError;

/// Sync state of one (date, category) pair
///
/// Only `Success` and `Failure` are ever persisted. `NoFile` and
/// `Unprocessed` are derived when a status is read, and `Processing` lives in
/// the job coordinator while a run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    NoFile,
    Unprocessed,
    Processing,
    Success,
    Failure,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NoFile => "NO_FILE",
            SyncState::Unprocessed => "UNPROCESSED",
            SyncState::Processing => "PROCESSING",
            SyncState::Success => "SUCCESS",
            SyncState::Failure => "FAILURE",
        }
    }

    /// Whether this state is written to the durable store
    pub fn is_persisted(&self) -> bool {
        matches!(self, SyncState::Success | SyncState::Failure)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NO_FILE" => Ok(SyncState::NoFile),
            "UNPROCESSED" => Ok(SyncState::Unprocessed),
            "PROCESSING" => Ok(SyncState::Processing),
            "SUCCESS" => Ok(SyncState::Success),
            "FAILURE" => Ok(SyncState::Failure),
            other => Err(EventLogError::InvalidState(other.to_string())),
        }
    }
}

/// Outcome record for one (date, category) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub sync_date: NaiveDate,
    pub category: Category,
    pub state: SyncState,
    pub message: String,
    pub last_modified: NaiveDateTime,
}

impl SyncStatus {
    pub fn new(
        sync_date: NaiveDate,
        category: Category,
        state: SyncState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sync_date,
            category,
            state,
            message: message.into(),
            last_modified: Local::now().naive_local(),
        }
    }

    pub fn processing(sync_date: NaiveDate, category: Category) -> Self {
        Self::new(sync_date, category, SyncState::Processing, "Processing")
    }

    pub fn unprocessed(sync_date: NaiveDate, category: Category) -> Self {
        Self::new(sync_date, category, SyncState::Unprocessed, "Not yet processed")
    }

    /// Status for a day without an export file. `today` picks the wording.
    pub fn no_file(sync_date: NaiveDate, category: Category, today: NaiveDate) -> Self {
        let message = if sync_date == today {
            "No log file for today has been generated yet".to_string()
        } else {
            format!("No log file exists for date {sync_date}")
        };
        Self::new(sync_date, category, SyncState::NoFile, message)
    }

    pub fn is_success(&self) -> bool {
        self.state == SyncState::Success
    }
}

/// Reference to the remote export file of one category for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocator {
    pub category: Category,
    pub log_date: NaiveDate,
    /// Opaque path of the file content on the remote platform
    pub reference: String,
}

/// Last processed row of an interrupted or running sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sync_date: NaiveDate,
    pub category: Category,
    pub row: u64,
    pub rows_total: u64,
}

impl Checkpoint {
    /// Whether every counted row was processed
    pub fn is_complete(&self) -> bool {
        self.row >= self.rows_total
    }

    /// First row a resumed run has to process
    pub fn resume_from(&self) -> u64 {
        self.row + 1
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_from_str() {
        assert_eq!("SUCCESS".parse::<SyncState>().unwrap(), SyncState::Success);
        assert_eq!("NO_FILE".parse::<SyncState>().unwrap(), SyncState::NoFile);
        assert!("success".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_sync_state_serde_matches_display() {
        let json = serde_json::to_string(&SyncState::NoFile).unwrap();
        assert_eq!(json, "\"NO_FILE\"");
        assert_eq!(SyncState::NoFile.to_string(), "NO_FILE");
    }

    #[test]
    fn test_only_terminal_states_persist() {
        assert!(SyncState::Success.is_persisted());
        assert!(SyncState::Failure.is_persisted());
        assert!(!SyncState::Processing.is_persisted());
        assert!(!SyncState::NoFile.is_persisted());
        assert!(!SyncState::Unprocessed.is_persisted());
    }

    #[test]
    fn test_no_file_wording() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 17).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2025, 3, 16).unwrap();

        let status = SyncStatus::no_file(today, Category::ApexCallout, today);
        assert_eq!(status.message, "No log file for today has been generated yet");

        let status = SyncStatus::no_file(yesterday, Category::ApexCallout, today);
        assert_eq!(status.message, "No log file exists for date 2025-03-16");
        assert_eq!(status.state, SyncState::NoFile);
    }

    #[test]
    fn test_checkpoint_resume() {
        let checkpoint = Checkpoint {
            sync_date: NaiveDate::from_ymd_opt(2025, 3, 16).unwrap(),
            category: Category::ApexCallout,
            row: 140,
            rows_total: 250,
        };
        assert!(!checkpoint.is_complete());
        assert_eq!(checkpoint.resume_from(), 141);
    }
}
