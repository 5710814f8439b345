//! SQLite persistence for batch jobs
//!
//! Every status change goes through a conditional `UPDATE ... WHERE status = ?`
//! so concurrent schedulers and management calls never overwrite each other,
//! and every change appends a row to `batch_job_events` in the same
//! transaction.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::job::{
    new_job_id, ActivityRunStatus, BatchJob, JobActivity, JobDetail, JobEvent, JobFilter,
    JobPage, JobProgress, JobStatus, SubmitJob,
};
use super::{BatchError, BatchResult};
use crate::ingestion::backoff::DEFAULT_MAX_RETRIES;
use crate::ingestion::ErrorClass;
use crate::metrics;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How many times a cancel re-reads a job that changed underneath it
const CANCEL_ATTEMPTS: usize = 3;

/// Result of processing one activity
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// Emissions calculated
    Succeeded {
        /// Calculated emissions in kg CO2e
        emissions_kg: f64,
    },
    /// Non-retryable failure; the activity is final
    Failed {
        /// Failure class
        class: ErrorClass,
        /// Failure message
        message: String,
    },
    /// Transient failure; the activity stays pending for the next pass
    Deferred {
        /// Failure class
        class: ErrorClass,
        /// Failure message
        message: String,
    },
}

impl ActivityOutcome {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityOutcome::Succeeded { .. } => "succeeded",
            ActivityOutcome::Failed { .. } => "failed",
            ActivityOutcome::Deferred { .. } => "deferred",
        }
    }
}

/// How a worker leaves a job at the end of a pass
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    /// All activities succeeded
    Completed,
    /// The job is terminally failed
    Failed {
        /// Class of the deciding failure
        class: ErrorClass,
        /// Message of the deciding failure
        message: String,
    },
    /// Cancelled at an activity boundary
    Cancelled,
    /// Transient leftovers; queue again once `next_retry_at` passes
    Retrying {
        /// Earliest time the job is queued again
        next_retry_at: DateTime<Utc>,
        /// Class of the last transient failure
        class: ErrorClass,
        /// Message of the last transient failure
        message: String,
    },
}

impl FinishOutcome {
    /// Status the job ends in
    pub fn status(&self) -> JobStatus {
        match self {
            FinishOutcome::Completed => JobStatus::Completed,
            FinishOutcome::Failed { .. } => JobStatus::Failed,
            FinishOutcome::Cancelled => JobStatus::Cancelled,
            FinishOutcome::Retrying { .. } => JobStatus::Retrying,
        }
    }
}

/// SQLite-backed job store
#[derive(Debug, Clone)]
pub struct BatchStore {
    pool: SqlitePool,
}

impl BatchStore {
    /// Open (creating if needed) the database at `url` and apply migrations
    pub async fn connect(url: &str) -> BatchResult<Self> {
        Self::connect_with(url, 5).await
    }

    /// Like [`connect`](Self::connect) with an explicit pool size.
    ///
    /// In-memory databases are private to a connection, so they always get a
    /// pool of one.
    pub async fn connect_with(url: &str, max_connections: u32) -> BatchResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying migrations
    pub async fn from_pool(pool: SqlitePool) -> BatchResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool, shared with the activity store
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new job in `Pending` with one row per activity
    #[instrument(skip_all, fields(org_id = %submit.org_id))]
    pub async fn create(&self, submit: &SubmitJob) -> BatchResult<BatchJob> {
        submit.validate()?;

        let id = new_job_id();
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batch_jobs (id, org_id, workspace_id, status, priority, max_retries, \
             fail_fast, activity_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&submit.org_id)
        .bind(&submit.workspace_id)
        .bind(JobStatus::Pending.as_str())
        .bind(submit.priority)
        .bind(i64::from(submit.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)))
        .bind(submit.fail_fast.unwrap_or(false))
        .bind(submit.activity_ids.len() as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, activity_id) in submit.activity_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batch_job_activities (job_id, position, activity_id, updated_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(position as i64)
            .bind(activity_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut tx, &id, None, JobStatus::Pending, Some("submitted"), now).await?;
        tx.commit().await?;

        metrics::record_job_transition("none", JobStatus::Pending.as_str());
        info!(
            job_id = %id,
            activities = submit.activity_ids.len(),
            priority = submit.priority,
            "Job submitted"
        );
        self.get(&id).await
    }

    /// Job by id, if present
    pub async fn find(&self, id: &str) -> BatchResult<Option<BatchJob>> {
        let row = sqlx::query("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Job by id
    pub async fn get(&self, id: &str) -> BatchResult<BatchJob> {
        self.find(id)
            .await?
            .ok_or_else(|| BatchError::NotFound(id.to_string()))
    }

    /// Job with its activity rows and transition log
    pub async fn detail(&self, id: &str) -> BatchResult<JobDetail> {
        let job = self.get(id).await?;
        let activities = self.activities(id).await?;
        let events = self.events(id).await?;
        Ok(JobDetail {
            job,
            activities,
            events,
        })
    }

    /// Page of jobs matching `filter`, newest first
    #[instrument(skip_all)]
    pub async fn list(&self, filter: &JobFilter) -> BatchResult<JobPage> {
        let status = filter.status.map(|s| s.as_str());
        let limit = filter.effective_limit();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batch_jobs \
             WHERE (? IS NULL OR org_id = ?) AND (? IS NULL OR status = ?)",
        )
        .bind(filter.org_id.as_deref())
        .bind(filter.org_id.as_deref())
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT * FROM batch_jobs \
             WHERE (? IS NULL OR org_id = ?) AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(filter.org_id.as_deref())
        .bind(filter.org_id.as_deref())
        .bind(status)
        .bind(status)
        .bind(i64::from(limit))
        .bind(i64::from(filter.offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(JobPage {
            jobs: rows.iter().map(job_from_row).collect::<BatchResult<_>>()?,
            total: non_negative(total),
            limit,
            offset: filter.offset,
        })
    }

    /// Move `Pending` jobs and `Retrying` jobs whose backoff elapsed to `Queued`.
    ///
    /// Returns how many jobs were promoted.
    #[instrument(skip_all)]
    pub async fn promote_ready(&self, now: DateTime<Utc>) -> BatchResult<u64> {
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        // Writes come first so the transaction takes the write lock up front
        let ready: Vec<String> = sqlx::query_scalar(
            "UPDATE batch_jobs SET status = 'queued', updated_at = ? \
             WHERE status = 'pending' RETURNING id",
        )
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;
        let backed_off: Vec<String> = sqlx::query_scalar(
            "UPDATE batch_jobs SET status = 'queued', next_retry_at = NULL, updated_at = ? \
             WHERE status = 'retrying' AND (next_retry_at IS NULL OR next_retry_at <= ?) \
             RETURNING id",
        )
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ready {
            insert_event(
                &mut tx,
                id,
                Some(JobStatus::Pending),
                JobStatus::Queued,
                Some("ready"),
                now_ms,
            )
            .await?;
        }
        for id in &backed_off {
            insert_event(
                &mut tx,
                id,
                Some(JobStatus::Retrying),
                JobStatus::Queued,
                Some("retry backoff elapsed"),
                now_ms,
            )
            .await?;
        }
        tx.commit().await?;

        for _ in &ready {
            metrics::record_job_transition(JobStatus::Pending.as_str(), JobStatus::Queued.as_str());
        }
        for _ in &backed_off {
            metrics::record_job_transition(JobStatus::Retrying.as_str(), JobStatus::Queued.as_str());
        }
        let promoted = (ready.len() + backed_off.len()) as u64;
        if promoted > 0 {
            debug!(count = promoted, "Promoted jobs to queued");
        }
        Ok(promoted)
    }

    /// Jobs a worker may claim at `now`: queued, or processing with a lapsed
    /// lock. Highest priority first, oldest first within a priority.
    pub async fn fetch_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BatchResult<Vec<BatchJob>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_jobs \
             WHERE status = 'queued' \
                OR (status = 'processing' AND (lock_expires_at IS NULL OR lock_expires_at < ?)) \
             ORDER BY priority DESC, created_at ASC LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Atomically take the lock on `job` for `owner`.
    ///
    /// The conditional update is the first statement of the transaction, so
    /// of several concurrent claimers exactly one sees a changed row. Returns
    /// `None` when another worker got there first or the job moved on.
    #[instrument(skip_all, fields(job_id = %job.id, owner = %owner))]
    pub async fn claim(
        &self,
        job: &BatchJob,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BatchResult<Option<BatchJob>> {
        let now_ms = now.timestamp_millis();
        let expires_ms = now_ms.saturating_add(ttl_millis(ttl));
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE batch_jobs \
             SET status = 'processing', lock_owner = ?, lock_expires_at = ?, \
                 started_at = COALESCE(started_at, ?), updated_at = ? \
             WHERE id = ? AND status = ? \
               AND (lock_owner IS NULL OR lock_expires_at IS NULL OR lock_expires_at < ?)",
        )
        .bind(owner)
        .bind(expires_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Claim lost");
            return Ok(None);
        }

        let message = match &job.lock_owner {
            Some(previous) if job.status == JobStatus::Processing => {
                format!("reclaimed by {owner} from expired lock of {previous}")
            }
            _ => format!("claimed by {owner}"),
        };
        insert_event(
            &mut tx,
            &job.id,
            Some(job.status),
            JobStatus::Processing,
            Some(message.as_str()),
            now_ms,
        )
        .await?;
        tx.commit().await?;

        metrics::record_job_transition(job.status.as_str(), JobStatus::Processing.as_str());
        info!(attempt = job.attempt, "{message}");
        self.find(&job.id).await
    }

    /// Extend the lock held by `owner`
    pub async fn refresh_lock(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BatchResult<()> {
        let now_ms = now.timestamp_millis();
        let updated = sqlx::query(
            "UPDATE batch_jobs SET lock_expires_at = ?, updated_at = ? \
             WHERE id = ? AND lock_owner = ? AND status = 'processing'",
        )
        .bind(now_ms.saturating_add(ttl_millis(ttl)))
        .bind(now_ms)
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(lock_lost(job_id, owner));
        }
        Ok(())
    }

    /// All activity rows of a job in processing order
    pub async fn activities(&self, job_id: &str) -> BatchResult<Vec<JobActivity>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_job_activities WHERE job_id = ? ORDER BY position ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    /// Activity rows without a final outcome, in processing order
    pub async fn pending_activities(&self, job_id: &str) -> BatchResult<Vec<JobActivity>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_job_activities \
             WHERE job_id = ? AND status = 'pending' ORDER BY position ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    /// Whether cancellation was requested for a job
    pub async fn is_cancel_requested(&self, job_id: &str) -> BatchResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM batch_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        flag.ok_or_else(|| BatchError::NotFound(job_id.to_string()))
    }

    /// Persist one activity outcome together with the job counters.
    ///
    /// Fails with [`BatchError::LockLost`] and writes nothing when `owner` no
    /// longer holds the job.
    #[instrument(skip_all, fields(job_id = %job_id, position = position, outcome = outcome.as_str()))]
    pub async fn record_activity_outcome(
        &self,
        job_id: &str,
        owner: &str,
        position: u32,
        outcome: &ActivityOutcome,
    ) -> BatchResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let guard = sqlx::query(
            "UPDATE batch_jobs SET updated_at = ? \
             WHERE id = ? AND lock_owner = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(job_id)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        if guard.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(lock_lost(job_id, owner));
        }

        match outcome {
            ActivityOutcome::Succeeded { emissions_kg } => {
                let updated = sqlx::query(
                    "UPDATE batch_job_activities \
                     SET status = 'succeeded', emissions_kg = ?, error_class = NULL, \
                         error_message = NULL, attempts = attempts + 1, updated_at = ? \
                     WHERE job_id = ? AND position = ? AND status = 'pending'",
                )
                .bind(emissions_kg)
                .bind(now)
                .bind(job_id)
                .bind(i64::from(position))
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 1 {
                    sqlx::query(
                        "UPDATE batch_jobs SET processed = processed + 1, \
                         succeeded = succeeded + 1, total_emissions_kg = total_emissions_kg + ? \
                         WHERE id = ?",
                    )
                    .bind(emissions_kg)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            ActivityOutcome::Failed { class, message } => {
                let updated = sqlx::query(
                    "UPDATE batch_job_activities \
                     SET status = 'failed', error_class = ?, error_message = ?, \
                         attempts = attempts + 1, updated_at = ? \
                     WHERE job_id = ? AND position = ? AND status = 'pending'",
                )
                .bind(class.as_str())
                .bind(message)
                .bind(now)
                .bind(job_id)
                .bind(i64::from(position))
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 1 {
                    sqlx::query(
                        "UPDATE batch_jobs SET processed = processed + 1, failed = failed + 1, \
                         last_error_class = ?, last_error = ? WHERE id = ?",
                    )
                    .bind(class.as_str())
                    .bind(message)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            ActivityOutcome::Deferred { class, message } => {
                sqlx::query(
                    "UPDATE batch_job_activities \
                     SET error_class = ?, error_message = ?, attempts = attempts + 1, \
                         updated_at = ? \
                     WHERE job_id = ? AND position = ? AND status = 'pending'",
                )
                .bind(class.as_str())
                .bind(message)
                .bind(now)
                .bind(job_id)
                .bind(i64::from(position))
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE batch_jobs SET last_error_class = ?, last_error = ? WHERE id = ?",
                )
                .bind(class.as_str())
                .bind(message)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        metrics::record_activity_outcome(outcome.as_str());
        Ok(())
    }

    /// End a pass: move the job out of `Processing` and drop the lock
    #[instrument(skip_all, fields(job_id = %job_id, status = %outcome.status()))]
    pub async fn finish(
        &self,
        job_id: &str,
        owner: &str,
        outcome: &FinishOutcome,
    ) -> BatchResult<BatchJob> {
        let now = Utc::now().timestamp_millis();
        let status = outcome.status();
        let (attempt_increment, next_retry_at, error_class, error, message) = match outcome {
            FinishOutcome::Completed => (0, None, None, None, "completed".to_string()),
            FinishOutcome::Cancelled => (0, None, None, None, "cancelled".to_string()),
            FinishOutcome::Failed { class, message } => (
                0,
                None,
                Some(class.as_str()),
                Some(message.as_str()),
                format!("failed: {class}"),
            ),
            FinishOutcome::Retrying {
                next_retry_at,
                class,
                message,
            } => (
                1,
                Some(next_retry_at.timestamp_millis()),
                Some(class.as_str()),
                Some(message.as_str()),
                format!("retry scheduled at {}", next_retry_at.to_rfc3339()),
            ),
        };
        let completed_at = status.is_terminal().then_some(now);

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE batch_jobs \
             SET status = ?, attempt = attempt + ?, next_retry_at = ?, \
                 last_error_class = COALESCE(?, last_error_class), \
                 last_error = COALESCE(?, last_error), \
                 lock_owner = NULL, lock_expires_at = NULL, \
                 completed_at = COALESCE(?, completed_at), updated_at = ? \
             WHERE id = ? AND lock_owner = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(attempt_increment)
        .bind(next_retry_at)
        .bind(error_class)
        .bind(error)
        .bind(completed_at)
        .bind(now)
        .bind(job_id)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(lock_lost(job_id, owner));
        }

        insert_event(
            &mut tx,
            job_id,
            Some(JobStatus::Processing),
            status,
            Some(message.as_str()),
            now,
        )
        .await?;
        tx.commit().await?;

        metrics::record_job_transition(JobStatus::Processing.as_str(), status.as_str());
        self.get(job_id).await
    }

    /// Hand a processing job back to the queue, e.g. on shutdown
    pub async fn release(&self, job_id: &str, owner: &str) -> BatchResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE batch_jobs SET status = 'queued', lock_owner = NULL, lock_expires_at = NULL, \
             updated_at = ? WHERE id = ? AND lock_owner = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(job_id)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(lock_lost(job_id, owner));
        }
        insert_event(
            &mut tx,
            job_id,
            Some(JobStatus::Processing),
            JobStatus::Queued,
            Some("released on shutdown"),
            now,
        )
        .await?;
        tx.commit().await?;
        metrics::record_job_transition(JobStatus::Processing.as_str(), JobStatus::Queued.as_str());
        Ok(())
    }

    /// Cancel a job.
    ///
    /// Jobs not yet running go straight to `Cancelled`; a processing job gets
    /// `cancel_requested` set and its worker stops at the next activity
    /// boundary. Terminal jobs are rejected.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn request_cancel(&self, job_id: &str) -> BatchResult<BatchJob> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.get(job_id).await?;
            let now = Utc::now().timestamp_millis();

            match job.status {
                JobStatus::Pending | JobStatus::Queued | JobStatus::Retrying => {
                    let mut tx = self.pool.begin().await?;
                    let updated = sqlx::query(
                        "UPDATE batch_jobs SET status = 'cancelled', cancel_requested = 1, \
                         next_retry_at = NULL, completed_at = ?, updated_at = ? \
                         WHERE id = ? AND status = ?",
                    )
                    .bind(now)
                    .bind(now)
                    .bind(job_id)
                    .bind(job.status.as_str())
                    .execute(&mut *tx)
                    .await?;
                    if updated.rows_affected() == 0 {
                        tx.rollback().await?;
                        continue;
                    }
                    insert_event(
                        &mut tx,
                        job_id,
                        Some(job.status),
                        JobStatus::Cancelled,
                        Some("cancelled on request"),
                        now,
                    )
                    .await?;
                    tx.commit().await?;
                    metrics::record_job_transition(
                        job.status.as_str(),
                        JobStatus::Cancelled.as_str(),
                    );
                    info!(from = %job.status, "Job cancelled");
                    return self.get(job_id).await;
                }
                JobStatus::Processing => {
                    let updated = sqlx::query(
                        "UPDATE batch_jobs SET cancel_requested = 1, updated_at = ? \
                         WHERE id = ? AND status = 'processing'",
                    )
                    .bind(now)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
                    if updated.rows_affected() == 0 {
                        continue;
                    }
                    info!("Cancellation requested for running job");
                    return self.get(job_id).await;
                }
                status => {
                    return Err(BatchError::InvalidTransition {
                        id: job_id.to_string(),
                        from: status,
                        to: JobStatus::Cancelled,
                    })
                }
            }
        }
        Err(BatchError::Conflict(job_id.to_string()))
    }

    /// Re-queue a failed job with a fresh retry budget.
    ///
    /// Failed activity rows go back to pending; succeeded rows keep their
    /// results and are not recalculated.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn reset_for_retry(&self, job_id: &str) -> BatchResult<BatchJob> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE batch_jobs \
             SET status = 'queued', attempt = 0, processed = processed - failed, failed = 0, \
                 cancel_requested = 0, next_retry_at = NULL, completed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'failed'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let job = self.get(job_id).await?;
            return Err(BatchError::InvalidTransition {
                id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Queued,
            });
        }

        sqlx::query(
            "UPDATE batch_job_activities SET status = 'pending', updated_at = ? \
             WHERE job_id = ? AND status = 'failed'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        insert_event(
            &mut tx,
            job_id,
            Some(JobStatus::Failed),
            JobStatus::Queued,
            Some("manual retry"),
            now,
        )
        .await?;
        tx.commit().await?;

        metrics::record_job_transition(JobStatus::Failed.as_str(), JobStatus::Queued.as_str());
        info!("Job re-queued for retry");
        self.get(job_id).await
    }

    /// Jobs waiting to run: pending, queued or retrying
    pub async fn queue_depth(&self) -> BatchResult<u64> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batch_jobs WHERE status IN ('pending', 'queued', 'retrying')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(non_negative(depth))
    }

    /// Number of jobs per status; statuses without jobs are omitted
    pub async fn count_by_status(&self) -> BatchResult<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM batch_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = rows
            .iter()
            .map(|row| {
                let status = parse_status(row.try_get("status")?)?;
                let n: i64 = row.try_get("n")?;
                Ok((status, non_negative(n)))
            })
            .collect::<BatchResult<Vec<_>>>()?;
        counts.sort_by_key(|(status, _)| JobStatus::ALL.iter().position(|s| s == status));
        Ok(counts)
    }

    /// Transition log of a job, oldest first
    pub async fn events(&self, job_id: &str) -> BatchResult<Vec<JobEvent>> {
        let rows = sqlx::query("SELECT * FROM batch_job_events WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Whether the database answers a trivial query
    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    from: Option<JobStatus>,
    to: JobStatus,
    message: Option<&str>,
    now_ms: i64,
) -> BatchResult<()> {
    // Counters are copied from the job row as of this transaction
    sqlx::query(
        "INSERT INTO batch_job_events \
         (job_id, from_status, to_status, processed, succeeded, failed, total_emissions_kg, \
          message, created_at) \
         SELECT id, ?, ?, processed, succeeded, failed, total_emissions_kg, ?, ? \
         FROM batch_jobs WHERE id = ?",
    )
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(message)
    .bind(now_ms)
    .bind(job_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> BatchResult<BatchJob> {
    Ok(BatchJob {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        workspace_id: row.try_get("workspace_id")?,
        status: parse_status(row.try_get("status")?)?,
        priority: row.try_get("priority")?,
        attempt: row.try_get("attempt")?,
        max_retries: row.try_get("max_retries")?,
        fail_fast: row.try_get("fail_fast")?,
        activity_count: non_negative(row.try_get("activity_count")?),
        progress: JobProgress {
            processed: non_negative(row.try_get("processed")?),
            succeeded: non_negative(row.try_get("succeeded")?),
            failed: non_negative(row.try_get("failed")?),
            total_emissions_kg: row.try_get("total_emissions_kg")?,
        },
        cancel_requested: row.try_get("cancel_requested")?,
        lock_owner: row.try_get("lock_owner")?,
        lock_expires_at: optional_millis(row.try_get("lock_expires_at")?)?,
        next_retry_at: optional_millis(row.try_get("next_retry_at")?)?,
        last_error_class: optional_class(row.try_get("last_error_class")?)?,
        last_error: row.try_get("last_error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        started_at: optional_millis(row.try_get("started_at")?)?,
        completed_at: optional_millis(row.try_get("completed_at")?)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> BatchResult<JobActivity> {
    let status: String = row.try_get("status")?;
    Ok(JobActivity {
        position: row.try_get("position")?,
        activity_id: row.try_get("activity_id")?,
        status: ActivityRunStatus::from_str(&status).map_err(BatchError::Corrupt)?,
        emissions_kg: row.try_get("emissions_kg")?,
        error_class: optional_class(row.try_get("error_class")?)?,
        error_message: row.try_get("error_message")?,
        attempts: row.try_get("attempts")?,
    })
}

fn event_from_row(row: &SqliteRow) -> BatchResult<JobEvent> {
    let from: Option<String> = row.try_get("from_status")?;
    Ok(JobEvent {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        from_status: from.map(parse_status).transpose()?,
        to_status: parse_status(row.try_get("to_status")?)?,
        progress: JobProgress {
            processed: non_negative(row.try_get("processed")?),
            succeeded: non_negative(row.try_get("succeeded")?),
            failed: non_negative(row.try_get("failed")?),
            total_emissions_kg: row.try_get("total_emissions_kg")?,
        },
        message: row.try_get("message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn parse_status(value: String) -> BatchResult<JobStatus> {
    JobStatus::from_str(&value).map_err(BatchError::Corrupt)
}

fn optional_class(value: Option<String>) -> BatchResult<Option<ErrorClass>> {
    value
        .map(|v| ErrorClass::from_str(&v).map_err(BatchError::Corrupt))
        .transpose()
}

fn from_millis(ms: i64) -> BatchResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BatchError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn optional_millis(ms: Option<i64>) -> BatchResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn lock_lost(job_id: &str, owner: &str) -> BatchError {
    BatchError::LockLost {
        job_id: job_id.to_string(),
        owner: owner.to_string(),
    }
}
