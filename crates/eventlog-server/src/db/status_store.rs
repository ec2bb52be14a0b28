//! Postgres implementation of [`StatusStore`]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use eventlog_common::{Category, Checkpoint, SyncState, SyncStatus};
use sqlx::{FromRow, PgPool};
use tracing::warn;

use crate::ingest::status::{StatusStore, StoreError};

#[derive(Debug, FromRow)]
struct StatusRow {
    sync_date: NaiveDate,
    event_type: String,
    status: String,
    message: String,
    last_modified: NaiveDateTime,
}

impl TryFrom<StatusRow> for SyncStatus {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        let category: Category = row
            .event_type
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown event type {}", row.event_type)))?;
        let state: SyncState = row
            .status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown status {}", row.status)))?;
        Ok(SyncStatus {
            sync_date: row.sync_date,
            category,
            state,
            message: row.message,
            last_modified: row.last_modified,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProgressRow {
    sync_date: NaiveDate,
    event_type: String,
    progress: i64,
    goal: i64,
}

impl TryFrom<ProgressRow> for Checkpoint {
    type Error = StoreError;

    fn try_from(row: ProgressRow) -> Result<Self, Self::Error> {
        let category: Category = row
            .event_type
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown event type {}", row.event_type)))?;
        let row_number = u64::try_from(row.progress)
            .map_err(|_| StoreError::Corrupt(format!("negative progress {}", row.progress)))?;
        let rows_total = u64::try_from(row.goal)
            .map_err(|_| StoreError::Corrupt(format!("negative goal {}", row.goal)))?;
        Ok(Checkpoint {
            sync_date: row.sync_date,
            category,
            row: row_number,
            rows_total,
        })
    }
}

/// Status and checkpoint tables in Postgres
#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StoreError> {
        if !status.state.is_persisted() {
            return Err(StoreError::TransientState(status.state));
        }

        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            INSERT INTO log_sync_status (sync_date, event_type, status, message, last_modified)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (sync_date, event_type)
            DO UPDATE SET status = EXCLUDED.status,
                          message = EXCLUDED.message,
                          last_modified = now()
            RETURNING sync_date, event_type, status, message, last_modified
            "#,
        )
        .bind(status.sync_date)
        .bind(status.category.name())
        .bind(status.state.as_str())
        .bind(&status.message)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn load_statuses(&self) -> Result<Vec<SyncStatus>, StoreError> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT sync_date, event_type, status, message, last_modified
            FROM log_sync_status
            ORDER BY sync_date DESC, event_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            match SyncStatus::try_from(row) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(error = %e, "Skipping unreadable sync status row"),
            }
        }
        Ok(statuses)
    }

    async fn delete_status(&self, date: NaiveDate, category: Category) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM log_sync_status WHERE sync_date = $1 AND event_type = $2")
            .bind(date)
            .bind(category.name())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO log_sync_progress (sync_date, event_type, progress, goal, last_modified)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (sync_date, event_type)
            DO UPDATE SET progress = EXCLUDED.progress,
                          goal = EXCLUDED.goal,
                          last_modified = now()
            "#,
        )
        .bind(checkpoint.sync_date)
        .bind(checkpoint.category.name())
        .bind(to_db_count(checkpoint.row))
        .bind(to_db_count(checkpoint.rows_total))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_checkpoint(
        &self,
        date: NaiveDate,
        category: Category,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM log_sync_progress WHERE sync_date = $1 AND event_type = $2")
            .bind(date)
            .bind(category.name())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            "SELECT sync_date, event_type, progress, goal FROM log_sync_progress",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            match Checkpoint::try_from(row) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(error = %e, "Skipping unreadable checkpoint row"),
            }
        }
        Ok(checkpoints)
    }
}
