//! Sync request parameters and read models

pub mod metadata;

use chrono::NaiveDate;
use eventlog_common::{Category, EventLogError};
use serde::{Deserialize, Serialize};

pub use metadata::{MetadataResponse, METADATA_WINDOW_DAYS};

/// Keyword selecting every category
pub const ALL_CATEGORIES: &str = "ALL";

/// What a trigger applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    All,
    One(Category),
}

impl SyncTarget {
    pub fn parse(raw: &str) -> Result<Self, EventLogError> {
        if raw.trim().eq_ignore_ascii_case(ALL_CATEGORIES) {
            Ok(SyncTarget::All)
        } else {
            raw.parse().map(SyncTarget::One)
        }
    }
}

/// POST /sync?date=2025-03-16&category=ApexCallout&resume_from=141
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerQuery {
    pub date: NaiveDate,
    pub category: String,
    #[serde(default)]
    pub resume_from: Option<u64>,
}

/// One (date, category) pair, `ALL` not allowed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetQuery {
    pub date: NaiveDate,
    pub category: String,
}

impl TargetQuery {
    pub fn category(&self) -> Result<Category, EventLogError> {
        self.category.parse()
    }
}
