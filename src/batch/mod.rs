//! Durable batch processing
//!
//! A [`BatchJob`] references activities already persisted in an
//! [`ActivityStore`](crate::collaborators::ActivityStore). Jobs live in SQLite
//! ([`BatchStore`]); the [`BatchScheduler`] polls for dispatchable rows, claims
//! them with a conditional update and runs the emissions calculator over each
//! activity with progress persisted per activity. Any number of scheduler
//! processes may share one database: the row lock is the only coordination.
//!
//! [`BatchService`] is the management surface used by the CLI.

use thiserror::Error;

pub mod job;
pub mod scheduler;
pub mod service;
pub mod store;

pub use job::{
    ActivityRunStatus, BatchJob, JobActivity, JobDetail, JobEvent, JobFilter, JobPage,
    JobProgress, JobStatus, SubmitJob,
};
pub use scheduler::{BatchScheduler, SchedulerConfig, SchedulerStats};
pub use service::{BatchService, HealthReport, HealthStatus};
pub use store::{ActivityOutcome, BatchStore, FinishOutcome};

/// Result type for batch operations
pub type BatchResult<T> = Result<T, BatchError>;

/// Batch store, scheduler and service errors
#[derive(Debug, Error)]
pub enum BatchError {
    /// Query or connection failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// No job with this id
    #[error("job not found: {0}")]
    NotFound(String),

    /// The state machine does not allow the requested change
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job id
        id: String,
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Rejected submission or argument
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The worker no longer owns the job lock
    #[error("lock on job {job_id} is no longer held by {owner}")]
    LockLost {
        /// Job id
        job_id: String,
        /// Worker that believed it held the lock
        owner: String,
    },

    /// The job kept changing underneath a compare-and-set
    #[error("job {0} was modified concurrently, try again")]
    Conflict(String),

    /// A stored value could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl BatchError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BatchError::Database(err) => {
                matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
                    || err.to_string().contains("database is locked")
            }
            BatchError::Conflict(_) => true,
            _ => false,
        }
    }
}
