//! Metadata query
//!
//! Per category: every day of the recent window with derived states, plus
//! whatever older days have a persisted status. Newest first. The inventory
//! is read once per request.

use chrono::{Days, NaiveDate};
use eventlog_common::{Category, SyncStatus};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::ingest::{CoordinatorError, InventoryCache, JobCoordinator, StatusCache};

/// Days covered by the window, today included
pub const METADATA_WINDOW_DAYS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct MetadataResponse {
    pub categories: BTreeMap<String, Vec<SyncStatus>>,
}

pub async fn handle(
    coordinator: &JobCoordinator,
    statuses: &StatusCache,
    inventory: &InventoryCache,
    today: NaiveDate,
) -> Result<MetadataResponse, CoordinatorError> {
    let window_start = today
        .checked_sub_days(Days::new(METADATA_WINDOW_DAYS - 1))
        .unwrap_or(NaiveDate::MIN);
    let persisted = statuses.snapshot().await?;
    let listing = inventory.snapshot().await;

    let mut categories = BTreeMap::new();
    for category in Category::ALL {
        let listed = listing.get(&category).map(Vec::as_slice).unwrap_or_default();
        let mut entries = Vec::new();
        let mut date = today;
        while date >= window_start {
            entries.push(
                coordinator
                    .status_in_listing(date, category, listed)
                    .await?,
            );
            match date.pred_opt() {
                Some(previous) => date = previous,
                None => break,
            }
        }

        if let Some(by_date) = persisted.get(&category) {
            entries.extend(
                by_date
                    .range(..window_start)
                    .rev()
                    .map(|(_, status)| status.clone()),
            );
        }
        categories.insert(category.name().to_string(), entries);
    }

    Ok(MetadataResponse { categories })
}
