//! Inventory of available export files
//!
//! The platform finalizes a day's export around midday. A cached listing
//! stays fresh while "now" is on the same calendar day and in the same
//! half-day band as the capture time. The band before 12:30 and the band
//! after 13:30 are stable. Inside the cutover hour between them every lookup
//! refreshes.
//!
//! A refresh always relists every category and swaps the whole cache at once.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use eventlog_common::{Category, FileLocator};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::clock::Clock;
use super::source::EventLogSource;

/// 12:30 in seconds after midnight
const MORNING_BAND_END: u32 = 12 * 3600 + 30 * 60;
/// 13:30 in seconds after midnight
const AFTERNOON_BAND_START: u32 = 13 * 3600 + 30 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("Found {count} log files of type {category} for {date}, expected at most one")]
    Ambiguous {
        category: Category,
        date: NaiveDate,
        count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfDayBand {
    Morning,
    Cutover,
    Afternoon,
}

fn band(at: NaiveDateTime) -> HalfDayBand {
    let seconds = at.time().num_seconds_from_midnight();
    if seconds < MORNING_BAND_END {
        HalfDayBand::Morning
    } else if seconds > AFTERNOON_BAND_START {
        HalfDayBand::Afternoon
    } else {
        HalfDayBand::Cutover
    }
}

/// Whether a listing captured at `captured_at` may still be served at `now`
pub fn is_fresh(captured_at: NaiveDateTime, now: NaiveDateTime) -> bool {
    if captured_at.date() != now.date() {
        return false;
    }
    let captured_band = band(captured_at);
    captured_band != HalfDayBand::Cutover && captured_band == band(now)
}

#[derive(Debug, Clone)]
struct InventoryEntry {
    files: Vec<FileLocator>,
    captured_at: NaiveDateTime,
}

/// Cached per-category listing of export files
pub struct InventoryCache {
    source: Arc<dyn EventLogSource>,
    clock: Arc<dyn Clock>,
    caching: bool,
    entries: RwLock<HashMap<Category, InventoryEntry>>,
}

impl InventoryCache {
    pub fn new(source: Arc<dyn EventLogSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            caching: true,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// With caching off every lookup lists only the requested category
    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    /// Files listed for a category, refreshing the whole inventory when stale
    pub async fn get(&self, category: Category) -> Vec<FileLocator> {
        if !self.caching {
            return self.source.list_log_files(category).await;
        }

        if let Some(files) = self.cached(&*self.entries.read().await, category) {
            return files;
        }

        let mut entries = self.entries.write().await;
        // A concurrent caller may have refreshed while this one waited
        if let Some(files) = self.cached(&entries, category) {
            return files;
        }

        *entries = self.fetch_all().await;
        entries
            .get(&category)
            .map(|entry| entry.files.clone())
            .unwrap_or_default()
    }

    /// Listing of every category behind a single freshness check.
    ///
    /// Callers deriving many (date, category) states should read this once
    /// instead of asking per pair, since each stale lookup relists everything.
    pub async fn snapshot(&self) -> HashMap<Category, Vec<FileLocator>> {
        if !self.caching {
            let mut listing = HashMap::with_capacity(Category::ALL.len());
            for category in Category::ALL {
                listing.insert(category, self.source.list_log_files(category).await);
            }
            return listing;
        }

        if let Some(listing) = self.cached_all(&*self.entries.read().await) {
            return listing;
        }

        let mut entries = self.entries.write().await;
        if let Some(listing) = self.cached_all(&entries) {
            return listing;
        }

        *entries = self.fetch_all().await;
        entries
            .iter()
            .map(|(category, entry)| (*category, entry.files.clone()))
            .collect()
    }

    /// Files listed for one category on one day
    pub async fn files_for(&self, date: NaiveDate, category: Category) -> Vec<FileLocator> {
        self.get(category)
            .await
            .into_iter()
            .filter(|locator| locator.log_date == date)
            .collect()
    }

    /// The single file for (date, category), if the platform has one
    pub async fn resolve(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<Option<FileLocator>, InventoryError> {
        let mut files = self.files_for(date, category).await;
        match files.len() {
            0 | 1 => Ok(files.pop()),
            count => Err(InventoryError::Ambiguous {
                category,
                date,
                count,
            }),
        }
    }

    pub async fn has_file(&self, date: NaiveDate, category: Category) -> bool {
        !self.files_for(date, category).await.is_empty()
    }

    /// Drop the cached listing so the next lookup refreshes
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("Inventory cache cleared");
    }

    fn cached(
        &self,
        entries: &HashMap<Category, InventoryEntry>,
        category: Category,
    ) -> Option<Vec<FileLocator>> {
        let now = self.clock.now();
        entries
            .get(&category)
            .filter(|entry| is_fresh(entry.captured_at, now))
            .map(|entry| entry.files.clone())
    }

    fn cached_all(
        &self,
        entries: &HashMap<Category, InventoryEntry>,
    ) -> Option<HashMap<Category, Vec<FileLocator>>> {
        Category::ALL
            .into_iter()
            .map(|category| self.cached(entries, category).map(|files| (category, files)))
            .collect()
    }

    async fn fetch_all(&self) -> HashMap<Category, InventoryEntry> {
        let captured_at = self.clock.now();
        let mut entries = HashMap::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let files = self.source.list_log_files(category).await;
            debug!(category = %category, files = files.len(), "Listed log files");
            entries.insert(category, InventoryEntry { files, captured_at });
        }
        info!(captured_at = %captured_at, "Inventory cache refreshed");
        entries
    }
}
