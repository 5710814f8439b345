//! Batch job structures and status tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::BatchError;
use crate::ingestion::ErrorClass;

/// Priority given to submissions that do not set one
pub const DEFAULT_PRIORITY: i64 = 5;

/// Default page size for job listings
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Largest page a listing may request
pub const MAX_LIST_LIMIT: u32 = 500;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet eligible for dispatch
    #[default]
    Pending,
    /// Eligible for dispatch
    Queued,
    /// Claimed by a worker holding the row lock
    Processing,
    /// Waiting out a backoff before being queued again
    Retrying,
    /// Every activity succeeded
    Completed,
    /// Retries exhausted or a non-retryable activity failure
    Failed,
    /// Cancelled on request
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Stable string form used in the database and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs are never touched by the scheduler again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`.
    ///
    /// `Failed -> Queued` is only used by the management retry operation and
    /// `Processing -> Queued` only when a worker hands a job back on shutdown.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Retrying)
                | (Processing, Queued)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Invalid job status: {s}"))
    }
}

/// Per-job counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct JobProgress {
    /// Activities with a final outcome
    pub processed: u64,
    /// Activities whose emissions were calculated
    pub succeeded: u64,
    /// Activities that failed permanently
    pub failed: u64,
    /// Sum of calculated emissions
    pub total_emissions_kg: f64,
}

/// A batch job as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Job id
    pub id: String,
    /// Owning organization
    pub org_id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Current status
    pub status: JobStatus,
    /// Higher runs first
    pub priority: i64,
    /// Scheduler-level retries used so far
    pub attempt: u32,
    /// Scheduler-level retry budget
    pub max_retries: u32,
    /// Halt at the first non-retryable activity failure
    pub fail_fast: bool,
    /// Number of activities in the job
    pub activity_count: u64,
    /// Progress counters
    pub progress: JobProgress,
    /// Set by cancel while the job is processing
    pub cancel_requested: bool,
    /// Worker currently holding the lock
    pub lock_owner: Option<String>,
    /// When the lock lapses unless refreshed
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Earliest time a retrying job is queued again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Class of the most recent failure
    pub last_error_class: Option<ErrorClass>,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// First claim time
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// Fraction of activities with a final outcome, `0.0..=1.0`
    pub fn progress_ratio(&self) -> f64 {
        if self.activity_count == 0 {
            return 0.0;
        }
        self.progress.processed as f64 / self.activity_count as f64
    }

    /// Activities without a final outcome
    pub fn remaining(&self) -> u64 {
        self.activity_count.saturating_sub(self.progress.processed)
    }

    /// Whether some worker holds an unexpired lock at `now`
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// Whether the scheduler may retry the job after a transient failure
    pub fn has_retries_left(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Wall-clock processing time for finished jobs
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// Outcome of one activity within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityRunStatus {
    /// Not yet processed, or deferred after a transient failure
    #[default]
    Pending,
    /// Emissions calculated
    Succeeded,
    /// Failed with a non-retryable error
    Failed,
}

impl ActivityRunStatus {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityRunStatus::Pending => "pending",
            ActivityRunStatus::Succeeded => "succeeded",
            ActivityRunStatus::Failed => "failed",
        }
    }
}

impl FromStr for ActivityRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActivityRunStatus::Pending),
            "succeeded" => Ok(ActivityRunStatus::Succeeded),
            "failed" => Ok(ActivityRunStatus::Failed),
            _ => Err(format!("Invalid activity status: {s}")),
        }
    }
}

/// One activity reference within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobActivity {
    /// Zero-based processing order
    pub position: u32,
    /// Activity id
    pub activity_id: String,
    /// Outcome so far
    pub status: ActivityRunStatus,
    /// Calculated emissions
    pub emissions_kg: Option<f64>,
    /// Class of the last failure
    pub error_class: Option<ErrorClass>,
    /// Message of the last failure
    pub error_message: Option<String>,
    /// Calculator invocations so far
    pub attempts: u32,
}

/// One recorded status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Sequence number
    pub id: i64,
    /// Job id
    pub job_id: String,
    /// Previous status; `None` for the creation event
    pub from_status: Option<JobStatus>,
    /// New status
    pub to_status: JobStatus,
    /// Counters at the time of the transition
    pub progress: JobProgress,
    /// Context, such as the worker id or failure reason
    pub message: Option<String>,
    /// Transition time
    pub created_at: DateTime<Utc>,
}

/// Job submission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJob {
    /// Owning organization
    pub org_id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Activities to process, in order
    pub activity_ids: Vec<String>,
    /// Higher runs first
    pub priority: i64,
    /// Scheduler-level retry budget; the scheduler default applies when `None`
    pub max_retries: Option<u32>,
    /// Failure policy; the scheduler default applies when `None`
    pub fail_fast: Option<bool>,
}

impl SubmitJob {
    /// Submission with default priority and retry budget
    pub fn new(
        org_id: impl Into<String>,
        workspace_id: impl Into<String>,
        activity_ids: Vec<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            workspace_id: workspace_id.into(),
            activity_ids,
            priority: DEFAULT_PRIORITY,
            max_retries: None,
            fail_fast: None,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the failure policy
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// Reject empty tenants, empty or duplicate activity lists
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.org_id.trim().is_empty() || self.workspace_id.trim().is_empty() {
            return Err(BatchError::Invalid(
                "org_id and workspace_id are required".to_string(),
            ));
        }
        if self.activity_ids.is_empty() {
            return Err(BatchError::Invalid(
                "activity_ids cannot be empty".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(self.activity_ids.len());
        for id in &self.activity_ids {
            if id.trim().is_empty() {
                return Err(BatchError::Invalid("activity id cannot be empty".to_string()));
            }
            if !seen.insert(id.as_str()) {
                return Err(BatchError::Invalid(format!("duplicate activity id: {id}")));
            }
        }
        Ok(())
    }
}

/// Listing filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs of this organization
    pub org_id: Option<String>,
    /// Only jobs in this status
    pub status: Option<JobStatus>,
    /// Page size, clamped to [`MAX_LIST_LIMIT`]
    pub limit: u32,
    /// Rows to skip
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            org_id: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl JobFilter {
    /// Effective page size
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// One page of a job listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    /// Jobs on this page, newest first
    pub jobs: Vec<BatchJob>,
    /// Jobs matching the filter
    pub total: u64,
    /// Page size used
    pub limit: u32,
    /// Offset used
    pub offset: u32,
}

impl JobPage {
    /// Whether more rows follow this page
    pub fn has_more(&self) -> bool {
        u64::from(self.offset) + (self.jobs.len() as u64) < self.total
    }
}

/// A job with its activities and transition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// The job
    pub job: BatchJob,
    /// Activities in processing order
    pub activities: Vec<JobActivity>,
    /// Transitions, oldest first
    pub events: Vec<JobEvent>,
}

impl JobDetail {
    /// Statuses the job has passed through, starting with the creation status
    pub fn status_history(&self) -> Vec<JobStatus> {
        self.events.iter().map(|event| event.to_status).collect()
    }
}

/// Generate a job id
pub fn new_job_id() -> String {
    format!("job_{}", uuid::Uuid::new_v4().simple())
}
