//! Management surface over the batch store and, optionally, a running scheduler

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use super::job::{JobDetail, JobFilter, JobPage, JobStatus, SubmitJob};
use super::scheduler::{BatchScheduler, SchedulerConfig};
use super::store::BatchStore;
use super::BatchResult;

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Database reachable
    Healthy,
    /// Database unreachable
    Unhealthy,
}

/// Snapshot returned by [`BatchService::health`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Overall health
    pub status: HealthStatus,
    /// Whether an attached scheduler is polling
    pub scheduler_running: bool,
    /// Jobs waiting to run
    pub queue_depth: u64,
    /// Jobs being processed by the attached scheduler
    pub workers_active: usize,
    /// Jobs completed by the attached scheduler
    pub batches_processed: u64,
    /// Jobs failed by the attached scheduler
    pub batches_failed: u64,
    /// Emissions of jobs completed by the attached scheduler
    pub total_emissions_kg: f64,
    /// Jobs per status across the database
    pub jobs_by_status: Vec<(JobStatus, u64)>,
    /// Latest poll of the attached scheduler
    pub last_poll_at: Option<DateTime<Utc>>,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
}

/// Submit, inspect, cancel and retry batch jobs
#[derive(Clone)]
pub struct BatchService {
    store: BatchStore,
    defaults: SchedulerConfig,
    scheduler: Option<BatchScheduler>,
}

impl BatchService {
    /// Service over `store` using default submission settings
    pub fn new(store: BatchStore) -> Self {
        Self {
            store,
            defaults: SchedulerConfig::default(),
            scheduler: None,
        }
    }

    /// Take the default retry budget and failure policy from `config`
    pub fn with_defaults(mut self, config: SchedulerConfig) -> Self {
        self.defaults = config;
        self
    }

    /// Report on `scheduler` in [`health`](Self::health)
    pub fn with_scheduler(mut self, scheduler: BatchScheduler) -> Self {
        self.defaults = scheduler.config().clone();
        self.scheduler = Some(scheduler);
        self
    }

    /// The store behind the service
    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    /// Create a job and return its id
    #[instrument(skip_all, fields(org_id = %request.org_id))]
    pub async fn submit(&self, mut request: SubmitJob) -> BatchResult<String> {
        request.max_retries.get_or_insert(self.defaults.max_retries);
        request.fail_fast.get_or_insert(self.defaults.fail_fast);
        let job = self.store.create(&request).await?;
        Ok(job.id)
    }

    /// Job with its activities and transition log
    pub async fn get(&self, job_id: &str) -> BatchResult<JobDetail> {
        self.store.detail(job_id).await
    }

    /// Filtered, paginated listing
    pub async fn list(&self, filter: &JobFilter) -> BatchResult<JobPage> {
        self.store.list(filter).await
    }

    /// Cancel a job; running jobs stop at their next activity boundary
    pub async fn cancel(&self, job_id: &str) -> BatchResult<JobDetail> {
        self.store.request_cancel(job_id).await?;
        self.store.detail(job_id).await
    }

    /// Re-queue a failed job
    pub async fn retry(&self, job_id: &str) -> BatchResult<JobDetail> {
        let job = self.store.reset_for_retry(job_id).await?;
        info!(job_id = %job.id, "Retry requested");
        self.store.detail(job_id).await
    }

    /// Database reachability, queue depth and scheduler counters
    pub async fn health(&self) -> BatchResult<HealthReport> {
        let timestamp = Utc::now();
        if !self.store.ping().await {
            return Ok(HealthReport {
                status: HealthStatus::Unhealthy,
                scheduler_running: self.scheduler.as_ref().is_some_and(|s| s.is_running()),
                queue_depth: 0,
                workers_active: self.scheduler.as_ref().map_or(0, |s| s.workers_active()),
                batches_processed: 0,
                batches_failed: 0,
                total_emissions_kg: 0.0,
                jobs_by_status: Vec::new(),
                last_poll_at: None,
                timestamp,
            });
        }

        let queue_depth = self.store.queue_depth().await?;
        let jobs_by_status = self.store.count_by_status().await?;
        let (running, workers, stats) = match &self.scheduler {
            Some(scheduler) => (
                scheduler.is_running(),
                scheduler.workers_active(),
                Some(scheduler.stats().await),
            ),
            None => (false, 0, None),
        };
        let stats = stats.unwrap_or_default();

        Ok(HealthReport {
            status: HealthStatus::Healthy,
            scheduler_running: running,
            queue_depth,
            workers_active: workers,
            batches_processed: stats.batches_processed,
            batches_failed: stats.batches_failed,
            total_emissions_kg: stats.total_emissions_kg,
            jobs_by_status,
            last_poll_at: stats.last_poll_at,
            timestamp,
        })
    }
}
