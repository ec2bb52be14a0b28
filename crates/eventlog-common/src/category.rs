//! Event log category registry
//!
//! Every category of daily export file has its own field schema. The
//! descriptor decides which field carries the log message, which fields go
//! into the public and secure log contexts, and which fields become labels on
//! the category's metric counter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EventLogError;

/// Name of the label appended after the declared metric label fields.
pub const METRIC_DATE_LABEL: &str = "LOG_DATE";

/// Log categories known to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    ApexUnexpectedException,
    ApexCallout,
    FlowExecution,
}

impl Category {
    /// All categories in the order batch runs visit them
    pub const ALL: [Category; 3] = [
        Category::ApexUnexpectedException,
        Category::ApexCallout,
        Category::FlowExecution,
    ];

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Static descriptor for this category
    pub fn descriptor(self) -> &'static CategoryDescriptor {
        match self {
            Category::ApexUnexpectedException => &APEX_UNEXPECTED_EXCEPTION,
            Category::ApexCallout => &APEX_CALLOUT,
            Category::FlowExecution => &FLOW_EXECUTION,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EventLogError::UnknownCategory(s.to_string()))
    }
}

/// How a raw field value is turned into a metric label value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTransform {
    /// Use the value as is
    Raw,
    /// Strip query strings and mask variable path segments
    NormalizeUrl,
    /// Bucket a millisecond duration into a fixed range
    DurationBucket,
    /// Bucket a byte count into a fixed range
    SizeBucket,
}

/// Immutable description of one category's field schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryDescriptor {
    pub name: &'static str,
    /// Field whose value is emitted as the log message
    pub message_field: Option<&'static str>,
    /// Context fields safe for the public log destination
    pub context_fields: &'static [&'static str],
    /// Context fields only written to the secure destination
    pub sensitive_fields: &'static [&'static str],
    /// Ordered label fields of the category counter
    pub metric_labels: &'static [&'static str],
    /// Field whose first ten characters form the date label
    pub metric_date_field: Option<&'static str>,
    pub url_fields: &'static [&'static str],
    pub duration_fields: &'static [&'static str],
    pub size_fields: &'static [&'static str],
}

impl CategoryDescriptor {
    pub fn emits_messages(&self) -> bool {
        self.message_field.is_some()
    }

    pub fn records_metrics(&self) -> bool {
        !self.metric_labels.is_empty()
    }

    /// A category with neither messages nor metrics is only useful for
    /// inspecting its raw rows.
    pub fn is_inspection(&self) -> bool {
        !self.emits_messages() && !self.records_metrics()
    }

    pub fn label_transform(&self, field: &str) -> LabelTransform {
        if self.url_fields.contains(&field) {
            LabelTransform::NormalizeUrl
        } else if self.duration_fields.contains(&field) {
            LabelTransform::DurationBucket
        } else if self.size_fields.contains(&field) {
            LabelTransform::SizeBucket
        } else {
            LabelTransform::Raw
        }
    }

    /// Label names registered on the category counter, date label last
    pub fn metric_label_names(&self) -> Vec<&'static str> {
        let mut names = self.metric_labels.to_vec();
        names.push(METRIC_DATE_LABEL);
        names
    }
}

static APEX_UNEXPECTED_EXCEPTION: CategoryDescriptor = CategoryDescriptor {
    name: "ApexUnexpectedException",
    message_field: Some("EXCEPTION_MESSAGE"),
    context_fields: &[
        "EVENT_TYPE",
        "TIMESTAMP",
        "TIMESTAMP_DERIVED",
        "REQUEST_ID",
        "ORGANIZATION_ID",
        "EXCEPTION_TYPE",
        "EXCEPTION_CATEGORY",
    ],
    sensitive_fields: &["STACK_TRACE", "USER_ID", "USER_ID_DERIVED"],
    metric_labels: &[],
    metric_date_field: None,
    url_fields: &[],
    duration_fields: &[],
    size_fields: &[],
};

static APEX_CALLOUT: CategoryDescriptor = CategoryDescriptor {
    name: "ApexCallout",
    message_field: None,
    context_fields: &["EVENT_TYPE", "TIMESTAMP_DERIVED", "REQUEST_ID"],
    sensitive_fields: &["USER_ID_DERIVED"],
    metric_labels: &[
        "TYPE",
        "METHOD",
        "SUCCESS",
        "STATUS_CODE",
        "URL",
        "TIME",
        "REQUEST_SIZE",
        "RESPONSE_SIZE",
    ],
    metric_date_field: Some("TIMESTAMP_DERIVED"),
    url_fields: &["URL"],
    duration_fields: &["TIME"],
    size_fields: &["REQUEST_SIZE", "RESPONSE_SIZE"],
};

static FLOW_EXECUTION: CategoryDescriptor = CategoryDescriptor {
    name: "FlowExecution",
    message_field: None,
    context_fields: &[],
    sensitive_fields: &[],
    metric_labels: &[],
    metric_date_field: None,
    url_fields: &[],
    duration_fields: &[],
    size_fields: &[],
};
