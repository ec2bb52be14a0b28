//! Single-slot job coordinator
//!
//! At most one ingestion run executes per coordinator. Activation claims the
//! slot under a lock and hands the run to a background task, so callers
//! return immediately and observe the run by polling. The slot is released by
//! the supervising task whether the run succeeds, fails or panics.

use chrono::NaiveDate;
use eventlog_common::{Category, FileLocator, SyncState, SyncStatus};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::inventory::{InventoryCache, InventoryError};
use super::metrics::MetricsRecorder;
use super::pipeline::{IngestionPipeline, RunProgress};
use super::status::{StatusCache, StoreError};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("A sync of {category} for {date} is already running")]
    Conflict { date: NaiveDate, category: Category },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Answer to a progress poll for one (date, category)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollStatus {
    /// The coordinator tracks a different (date, category), or none at all
    Mismatch {
        tracked: Option<(NaiveDate, Category)>,
    },
    /// A zero total means the rows are still being counted
    InProgress { processed: u64, total: u64 },
    Complete { status: SyncStatus },
    /// Idle without a result. Only reachable if a run task died.
    Inconsistent,
}

#[derive(Debug, Default)]
struct JobState {
    active: bool,
    target: Option<(NaiveDate, Category)>,
    last_result: Option<SyncStatus>,
}

/// Handle on a started run
#[derive(Debug)]
pub struct RunHandle {
    pub date: NaiveDate,
    pub category: Category,
    completion: oneshot::Receiver<SyncStatus>,
}

impl RunHandle {
    /// Wait for the terminal status. `None` if the run task died without one.
    pub async fn completion(self) -> Option<SyncStatus> {
        self.completion.await.ok()
    }
}

enum Started {
    Settled(SyncStatus),
    Running(RunHandle),
}

pub struct JobCoordinator {
    pipeline: Arc<IngestionPipeline>,
    statuses: Arc<StatusCache>,
    inventory: Arc<InventoryCache>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
    state: Mutex<JobState>,
    progress: Arc<RunProgress>,
    idle: watch::Sender<bool>,
}

impl JobCoordinator {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        statuses: Arc<StatusCache>,
        inventory: Arc<InventoryCache>,
        metrics: Arc<dyn MetricsRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            pipeline,
            statuses,
            inventory,
            metrics,
            clock,
            state: Mutex::new(JobState::default()),
            progress: Arc::new(RunProgress::new()),
            idle,
        })
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    /// Claim the job slot and start a run in the background.
    ///
    /// Fails with [`CoordinatorError::Conflict`] while another run holds the
    /// slot. The job state is left untouched in that case.
    pub fn activate(
        self: &Arc<Self>,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
    ) -> Result<RunHandle, CoordinatorError> {
        self.launch(date, category, resume_from, None)
    }

    fn launch(
        self: &Arc<Self>,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
        lookup: Option<Result<Option<FileLocator>, InventoryError>>,
    ) -> Result<RunHandle, CoordinatorError> {
        {
            let mut state = self.lock_state();
            if state.active {
                let (date, category) = state.target.unwrap_or((date, category));
                return Err(CoordinatorError::Conflict { date, category });
            }
            state.active = true;
            state.target = Some((date, category));
            state.last_result = None;
            self.progress.reset();
        }
        self.idle.send_replace(false);
        info!(date = %date, category = %category, resume_from, "Sync activated");

        let (done_tx, done_rx) = oneshot::channel();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.metrics.reset(category);

            let pipeline = Arc::clone(&coordinator.pipeline);
            let progress = Arc::clone(&coordinator.progress);
            let run = tokio::spawn(async move {
                match lookup {
                    Some(lookup) => {
                        pipeline
                            .run_resolved(date, category, lookup, resume_from, &progress)
                            .await
                    },
                    None => pipeline.run(date, category, resume_from, &progress).await,
                }
            });

            let result = match run.await {
                Ok(outcome) => Some(outcome.into_status()),
                Err(e) => {
                    error!(date = %date, category = %category, error = %e, "Sync task died without a result");
                    None
                },
            };

            coordinator.release(result.clone());
            if let Some(status) = result {
                let _ = done_tx.send(status);
            }
        });

        Ok(RunHandle {
            date,
            category,
            completion: done_rx,
        })
    }

    /// Report on the run for (date, category)
    pub fn poll(&self, date: NaiveDate, category: Category) -> PollStatus {
        let state = self.lock_state();
        if state.target != Some((date, category)) {
            return PollStatus::Mismatch {
                tracked: state.target,
            };
        }
        if state.active {
            let (processed, total) = self.progress.snapshot();
            return PollStatus::InProgress { processed, total };
        }
        match &state.last_result {
            Some(status) => PollStatus::Complete {
                status: status.clone(),
            },
            None => PollStatus::Inconsistent,
        }
    }

    /// Make sure (date, category) is synced.
    ///
    /// Returns the persisted status when it is already SUCCESS, NO_FILE when
    /// the platform has no file, and PROCESSING once a run was started.
    pub async fn trigger(
        self: &Arc<Self>,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
    ) -> Result<SyncStatus, CoordinatorError> {
        match self.start(date, category, resume_from).await? {
            Started::Settled(status) => Ok(status),
            Started::Running(_) => Ok(SyncStatus::processing(date, category)),
        }
    }

    /// Sync every category of one day, one run at a time
    pub async fn trigger_all(self: &Arc<Self>, date: NaiveDate, timeout: Duration) -> Vec<SyncStatus> {
        let mut results = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            results.push(self.sync_and_wait(date, category, 1, timeout).await);
        }
        results
    }

    /// Start a run for (date, category) and wait for its terminal status.
    ///
    /// A busy slot is waited out. When `timeout` passes first the last known
    /// status is returned: PROCESSING if the run is still going, UNPROCESSED
    /// if it never got the slot.
    pub async fn sync_and_wait(
        self: &Arc<Self>,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
        timeout: Duration,
    ) -> SyncStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.start(date, category, resume_from).await {
                Ok(Started::Settled(status)) => return status,
                Ok(Started::Running(handle)) => {
                    return match tokio::time::timeout_at(deadline, handle.completion()).await {
                        Ok(Some(status)) => status,
                        Ok(None) => SyncStatus::new(
                            date,
                            category,
                            SyncState::Failure,
                            "Sync task died without a result",
                        ),
                        Err(_) => {
                            warn!(date = %date, category = %category, "Gave up waiting for sync");
                            SyncStatus::processing(date, category)
                        },
                    };
                },
                Err(CoordinatorError::Conflict { .. }) => {
                    if !self.wait_idle_until(deadline).await {
                        warn!(date = %date, category = %category, "Job slot stayed busy");
                        return SyncStatus::new(
                            date,
                            category,
                            SyncState::Unprocessed,
                            "Job in progress",
                        );
                    }
                },
                Err(CoordinatorError::Store(e)) => {
                    error!(date = %date, category = %category, error = %e, "Failed to read sync status");
                    return SyncStatus::new(
                        date,
                        category,
                        SyncState::Failure,
                        format!("StoreError: {e}"),
                    );
                },
            }
        }
    }

    /// Current status of (date, category) including derived states
    pub async fn status(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<SyncStatus, CoordinatorError> {
        if let Some(status) = self.known_status(date, category).await? {
            return Ok(status);
        }
        let has_file = self.inventory.has_file(date, category).await;
        Ok(self.derived_status(date, category, has_file))
    }

    /// [`status`](Self::status) against a listing the caller already holds
    pub async fn status_in_listing(
        &self,
        date: NaiveDate,
        category: Category,
        listed: &[FileLocator],
    ) -> Result<SyncStatus, CoordinatorError> {
        if let Some(status) = self.known_status(date, category).await? {
            return Ok(status);
        }
        let has_file = listed.iter().any(|locator| locator.log_date == date);
        Ok(self.derived_status(date, category, has_file))
    }

    /// PROCESSING for the tracked run, otherwise the persisted status
    async fn known_status(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<Option<SyncStatus>, CoordinatorError> {
        {
            let state = self.lock_state();
            if state.active && state.target == Some((date, category)) {
                return Ok(Some(SyncStatus::processing(date, category)));
            }
        }
        Ok(self.statuses.get(date, category).await?)
    }

    fn derived_status(&self, date: NaiveDate, category: Category, has_file: bool) -> SyncStatus {
        if has_file {
            SyncStatus::unprocessed(date, category)
        } else {
            SyncStatus::no_file(date, category, self.clock.today())
        }
    }

    /// Pick up runs interrupted by a previous shutdown.
    ///
    /// Completed checkpoints are deleted. Incomplete ones are resumed one at
    /// a time on a background task. Returns the number of scheduled resumes.
    pub async fn resume_interrupted(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<usize, CoordinatorError> {
        let store = Arc::clone(self.statuses.store());
        let mut checkpoints = store.load_checkpoints().await?;
        checkpoints.sort_by_key(|cp| (cp.sync_date, cp.category));

        let mut pending = Vec::new();
        for checkpoint in checkpoints {
            if checkpoint.is_complete() {
                info!(
                    date = %checkpoint.sync_date,
                    category = %checkpoint.category,
                    "Removing checkpoint of completed sync"
                );
                store
                    .delete_checkpoint(checkpoint.sync_date, checkpoint.category)
                    .await?;
            } else {
                pending.push(checkpoint);
            }
        }

        let scheduled = pending.len();
        if scheduled > 0 {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                for checkpoint in pending {
                    info!(
                        date = %checkpoint.sync_date,
                        category = %checkpoint.category,
                        row = checkpoint.row,
                        total = checkpoint.rows_total,
                        "Resuming interrupted sync"
                    );
                    let status = coordinator
                        .sync_and_wait(
                            checkpoint.sync_date,
                            checkpoint.category,
                            checkpoint.resume_from(),
                            timeout,
                        )
                        .await;
                    info!(state = %status.state, message = %status.message, "Resumed sync ended");
                }
            });
        }
        Ok(scheduled)
    }

    async fn start(
        self: &Arc<Self>,
        date: NaiveDate,
        category: Category,
        resume_from: u64,
    ) -> Result<Started, CoordinatorError> {
        if let Some(existing) = self.statuses.get(date, category).await? {
            if existing.is_success() {
                return Ok(Started::Settled(existing));
            }
        }
        // The run reuses this lookup instead of listing again
        let lookup = self.inventory.resolve(date, category).await;
        if matches!(lookup, Ok(None)) {
            return Ok(Started::Settled(SyncStatus::no_file(
                date,
                category,
                self.clock.today(),
            )));
        }
        Ok(Started::Running(self.launch(
            date,
            category,
            resume_from,
            Some(lookup),
        )?))
    }

    fn release(&self, result: Option<SyncStatus>) {
        {
            let mut state = self.lock_state();
            state.active = false;
            state.last_result = result;
            self.progress.reset();
        }
        self.idle.send_replace(true);
    }

    async fn wait_idle_until(&self, deadline: Instant) -> bool {
        let mut idle = self.idle.subscribe();
        let reached = matches!(
            tokio::time::timeout_at(deadline, idle.wait_for(|idle| *idle)).await,
            Ok(Ok(_))
        );
        reached
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
