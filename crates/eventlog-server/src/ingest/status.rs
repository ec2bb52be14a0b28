//! Durable sync status and checkpoint storage with an in-memory mirror

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use eventlog_common::{Category, Checkpoint, SyncStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::clock::Clock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Refusing to persist transient state {0}")]
    TransientState(eventlog_common::SyncState),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

/// Durable store keyed by (date, category)
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert or overwrite the status of (date, category). Returns the
    /// record as stored, with the store's modification time.
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError>;

    async fn load_statuses(&self) -> Result<Vec<SyncStatus>, StoreError>;

    /// Returns whether a row was removed
    async fn delete_status(&self, date: NaiveDate, category: Category) -> Result<bool, StoreError>;

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn delete_checkpoint(&self, date: NaiveDate, category: Category)
        -> Result<(), StoreError>;

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError>;
}

type Key = (NaiveDate, Category);

/// Process-local store used in local mode
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    statuses: Mutex<HashMap<Key, SyncStatus>>,
    checkpoints: Mutex<HashMap<Key, Checkpoint>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError> {
        if !status.state.is_persisted() {
            return Err(StoreError::TransientState(status.state));
        }
        let stored = SyncStatus {
            last_modified: Local::now().naive_local(),
            ..status.clone()
        };
        lock(&self.statuses).insert((stored.sync_date, stored.category), stored.clone());
        Ok(stored)
    }

    async fn load_statuses(&self) -> Result<Vec<SyncStatus>, StoreError> {
        Ok(lock(&self.statuses).values().cloned().collect())
    }

    async fn delete_status(&self, date: NaiveDate, category: Category) -> Result<bool, StoreError> {
        Ok(lock(&self.statuses).remove(&(date, category)).is_some())
    }

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        lock(&self.checkpoints).insert((checkpoint.sync_date, checkpoint.category), *checkpoint);
        Ok(())
    }

    async fn delete_checkpoint(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<(), StoreError> {
        lock(&self.checkpoints).remove(&(date, category));
        Ok(())
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(lock(&self.checkpoints).values().copied().collect())
    }
}

/// Persisted statuses per category, keyed by date
pub type StatusSnapshot = HashMap<Category, BTreeMap<NaiveDate, SyncStatus>>;

#[derive(Debug, Default)]
struct CacheState {
    loaded_on: Option<NaiveDate>,
    statuses: StatusSnapshot,
}

/// In-memory mirror of the [`StatusStore`]
///
/// The mirror is reloaded wholesale when the local date changes and patched
/// in place on every write through it.
pub struct StatusCache {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl StatusCache {
    pub fn new(store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Persisted status of (date, category), if any
    pub async fn get(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<Option<SyncStatus>, StoreError> {
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        Ok(state
            .statuses
            .get(&category)
            .and_then(|by_date| by_date.get(&date))
            .cloned())
    }

    /// All persisted statuses
    pub async fn snapshot(&self) -> Result<StatusSnapshot, StoreError> {
        self.ensure_loaded().await?;
        Ok(self.state.read().await.statuses.clone())
    }

    /// Write a terminal status through to the store and patch the mirror
    pub async fn record(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError> {
        let stored = self.store.upsert_status(status).await?;
        let mut state = self.state.write().await;
        if state.loaded_on.is_some() {
            state
                .statuses
                .entry(stored.category)
                .or_default()
                .insert(stored.sync_date, stored.clone());
        }
        debug!(
            date = %stored.sync_date,
            category = %stored.category,
            state = %stored.state,
            "Recorded sync status"
        );
        Ok(stored)
    }

    /// Remove one persisted status and invalidate the whole mirror
    pub async fn delete(&self, date: NaiveDate, category: Category) -> Result<bool, StoreError> {
        let removed = self.store.delete_status(date, category).await?;
        self.clear().await;
        Ok(removed)
    }

    /// Forget the mirror so the next read reloads from the store
    pub async fn clear(&self) {
        *self.state.write().await = CacheState::default();
    }

    async fn ensure_loaded(&self) -> Result<(), StoreError> {
        let today = self.clock.today();
        if self.state.read().await.loaded_on == Some(today) {
            return Ok(());
        }

        let mut state = self.state.write().await;
        if state.loaded_on == Some(today) {
            return Ok(());
        }

        let mut statuses = StatusSnapshot::new();
        let loaded = self.store.load_statuses().await?;
        let count = loaded.len();
        for status in loaded {
            statuses
                .entry(status.category)
                .or_default()
                .insert(status.sync_date, status);
        }
        *state = CacheState {
            loaded_on: Some(today),
            statuses,
        };
        info!(count, today = %today, "Loaded sync statuses into cache");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ingest::clock::ManualClock;
    use eventlog_common::SyncState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts full loads so tests can tell reloads from patches
    struct CountingStore {
        inner: MemoryStatusStore,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl StatusStore for CountingStore {
        async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError> {
            self.inner.upsert_status(status).await
        }
        async fn load_statuses(&self) -> Result<Vec<SyncStatus>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load_statuses().await
        }
        async fn delete_status(&self, d: NaiveDate, c: Category) -> Result<bool, StoreError> {
            self.inner.delete_status(d, c).await
        }
        async fn upsert_checkpoint(&self, cp: &Checkpoint) -> Result<(), StoreError> {
            self.inner.upsert_checkpoint(cp).await
        }
        async fn delete_checkpoint(&self, d: NaiveDate, c: Category) -> Result<(), StoreError> {
            self.inner.delete_checkpoint(d, c).await
        }
        async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
            self.inner.load_checkpoints().await
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn setup() -> (Arc<CountingStore>, ManualClock, StatusCache) {
        let store = Arc::new(CountingStore {
            inner: MemoryStatusStore::new(),
            loads: AtomicUsize::new(0),
        });
        let clock = ManualClock::new(date(17).and_hms_opt(8, 0, 0).unwrap());
        let cache = StatusCache::new(store.clone(), Arc::new(clock.clone()));
        (store, clock, cache)
    }

    #[tokio::test]
    async fn test_memory_store_rejects_transient_states() {
        let store = MemoryStatusStore::new();
        let status = SyncStatus::processing(date(16), Category::ApexCallout);
        assert!(matches!(
            store.upsert_status(&status).await,
            Err(StoreError::TransientState(SyncState::Processing))
        ));
    }

    #[tokio::test]
    async fn test_record_patches_cache_without_reload() {
        let (store, _clock, cache) = setup();
        assert!(cache.get(date(16), Category::ApexCallout).await.unwrap().is_none());
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        let status = SyncStatus::new(date(16), Category::ApexCallout, SyncState::Success, "done");
        cache.record(&status).await.unwrap();

        let cached = cache.get(date(16), Category::ApexCallout).await.unwrap().unwrap();
        assert_eq!(cached.state, SyncState::Success);
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_earlier_attempt() {
        let (_store, _clock, cache) = setup();
        let failed = SyncStatus::new(date(16), Category::ApexCallout, SyncState::Failure, "boom");
        let succeeded = SyncStatus::new(date(16), Category::ApexCallout, SyncState::Success, "ok");
        cache.record(&failed).await.unwrap();
        cache.record(&succeeded).await.unwrap();

        let snapshot = cache.snapshot().await.unwrap();
        let by_date = snapshot.get(&Category::ApexCallout).unwrap();
        assert_eq!(by_date.len(), 1);
        assert_eq!(by_date[&date(16)].state, SyncState::Success);
    }

    #[tokio::test]
    async fn test_date_rollover_reloads() {
        let (store, clock, cache) = setup();
        cache.get(date(16), Category::ApexCallout).await.unwrap();
        cache.get(date(15), Category::ApexCallout).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        clock.set(date(18).and_hms_opt(0, 1, 0).unwrap());
        cache.get(date(16), Category::ApexCallout).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_invalidates_cache() {
        let (store, _clock, cache) = setup();
        let status = SyncStatus::new(date(16), Category::ApexCallout, SyncState::Failure, "x");
        cache.record(&status).await.unwrap();
        cache.get(date(16), Category::ApexCallout).await.unwrap();

        assert!(cache.delete(date(16), Category::ApexCallout).await.unwrap());
        assert!(cache.get(date(16), Category::ApexCallout).await.unwrap().is_none());
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }
}
