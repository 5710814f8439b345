//! Batch scheduler: poll loop, claim and worker pool
//!
//! Each poll promotes ready jobs, picks dispatchable ones in priority order
//! and claims them through [`BatchStore::claim`]. A claimed job runs on its own
//! task holding a semaphore permit, so at most `worker_pool_size` jobs run per
//! scheduler. While a worker runs, a heartbeat keeps the row lock alive; a
//! crashed worker's lock lapses and another scheduler resumes the job from its
//! persisted per-activity progress.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::job::{ActivityRunStatus, BatchJob, JobStatus};
use super::store::{ActivityOutcome, BatchStore, FinishOutcome};
use super::{BatchError, BatchResult};
use crate::collaborators::{ActivityStore, EmissionsCalculator};
use crate::ingestion::backoff::DEFAULT_MAX_RETRIES;
use crate::ingestion::{ClassifiedError, ErrorClass, ErrorClassifier, Jitter, RetryPolicy};
use crate::metrics::{self, JobMetrics};
use crate::shutdown::SharedShutdown;

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between polls
    pub poll_interval_ms: u64,
    /// Random extra delay in `[0, poll_jitter_ms)` added to every poll
    pub poll_jitter_ms: u64,
    /// Jobs running concurrently in this process
    pub worker_pool_size: usize,
    /// Most jobs claimed per poll
    pub batch_size: usize,
    /// Row lock lifetime; refreshed every third of it while a job runs
    pub lock_ttl_ms: u64,
    /// Job-level retry budget for submissions that do not set one
    pub max_retries: u32,
    /// Failure policy for submissions that do not set one
    pub fail_fast: bool,
    /// First job retry delay
    pub retry_base_delay_ms: u64,
    /// Largest job retry delay
    pub retry_max_delay_ms: u64,
    /// Give unknown activity failures one retry
    pub retry_unknown: bool,
    /// Deadline for retrieving and calculating one activity
    pub activity_timeout_ms: u64,
    /// Lock owner name; generated when absent
    pub worker_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            poll_jitter_ms: 5_000,
            worker_pool_size: 5,
            batch_size: 10,
            lock_ttl_ms: 300_000,
            max_retries: DEFAULT_MAX_RETRIES,
            fail_fast: false,
            retry_base_delay_ms: 30_000,
            retry_max_delay_ms: 900_000,
            retry_unknown: false,
            activity_timeout_ms: 60_000,
            worker_id: None,
        }
    }
}

impl SchedulerConfig {
    /// Delay between polls without jitter
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Row lock lifetime
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Heartbeat period, a third of the lock lifetime
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.lock_ttl_ms / 3).max(1))
    }

    /// Deadline per activity
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    /// Backoff between job retries
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            max_retries: self.max_retries,
            jitter: Jitter::Full,
            retry_unknown: self.retry_unknown,
        }
    }

    /// Configured worker id, or a fresh one unique to this process
    pub fn resolve_worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("worker-{}-{}", std::process::id(), &suffix[..8])
            }
        }
    }
}

/// Counters kept by one scheduler instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Polls run
    pub polls: u64,
    /// Jobs claimed
    pub jobs_claimed: u64,
    /// Jobs this scheduler completed
    pub batches_processed: u64,
    /// Jobs this scheduler failed
    pub batches_failed: u64,
    /// Passes that ended in a scheduled retry
    pub batches_retried: u64,
    /// Jobs this scheduler cancelled
    pub batches_cancelled: u64,
    /// Emissions of jobs completed here
    pub total_emissions_kg: f64,
    /// Start of the latest poll
    pub last_poll_at: Option<DateTime<Utc>>,
    /// When the next poll is due
    pub next_poll_at: Option<DateTime<Utc>>,
}

/// Durable batch scheduler; cheap to clone
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: BatchStore,
    activities: Arc<dyn ActivityStore>,
    calculator: Arc<dyn EmissionsCalculator>,
    config: SchedulerConfig,
    worker_id: String,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
    permits: Arc<Semaphore>,
    shutdown: SharedShutdown,
    running: AtomicBool,
    active_workers: AtomicUsize,
    stats: RwLock<SchedulerStats>,
}

impl BatchScheduler {
    /// Create a scheduler; nothing runs until [`run`](Self::run) or
    /// [`poll_once`](Self::poll_once)
    pub fn new(
        store: BatchStore,
        activities: Arc<dyn ActivityStore>,
        calculator: Arc<dyn EmissionsCalculator>,
        config: SchedulerConfig,
        shutdown: SharedShutdown,
    ) -> Self {
        let classifier = if config.retry_unknown {
            ErrorClassifier::retrying_unknown_once()
        } else {
            ErrorClassifier::new()
        };
        let pool_size = config.worker_pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                activities,
                calculator,
                worker_id: config.resolve_worker_id(),
                retry: config.retry_policy(),
                classifier,
                permits: Arc::new(Semaphore::new(pool_size)),
                shutdown,
                running: AtomicBool::new(false),
                active_workers: AtomicUsize::new(0),
                stats: RwLock::new(SchedulerStats::default()),
                config,
            }),
        }
    }

    /// Lock owner name of this scheduler
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Settings in effect
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The job store
    pub fn store(&self) -> &BatchStore {
        &self.inner.store
    }

    /// Whether the poll loop is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Jobs currently being processed by this scheduler
    pub fn workers_active(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters
    pub async fn stats(&self) -> SchedulerStats {
        self.inner.stats.read().await.clone()
    }

    /// Run the poll loop until shutdown is requested, then wait for in-flight
    /// workers to reach an activity boundary and hand their jobs back.
    pub async fn run(&self) -> BatchResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BatchError::Invalid(
                "scheduler is already running".to_string(),
            ));
        }
        info!(
            worker_id = %self.inner.worker_id,
            pool_size = self.inner.config.worker_pool_size,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "Batch scheduler started"
        );

        loop {
            if self.inner.shutdown.is_shutdown_requested() {
                break;
            }
            if let Err(e) = self.inner.poll().await {
                error!(error = %e, "Scheduler poll failed");
            }

            let delay = self.inner.next_delay();
            self.inner.stats.write().await.next_poll_at =
                chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);

            if !self.inner.shutdown.sleep(delay).await {
                info!("Shutdown requested, draining workers");
                break;
            }
        }

        self.wait_idle().await;
        self.inner.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.inner.worker_id, "Batch scheduler stopped");
        Ok(())
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn start(&self) -> JoinHandle<BatchResult<()>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Request shutdown through the shared coordinator
    pub fn stop(&self) {
        self.inner.shutdown.request_shutdown();
    }

    /// One poll: promote, select, claim and dispatch. Returns the number of
    /// jobs handed to workers; they keep running after this returns.
    pub async fn poll_once(&self) -> BatchResult<usize> {
        self.inner.poll().await
    }

    /// Wait until no worker of this scheduler is running
    pub async fn wait_idle(&self) {
        let permits = self.inner.config.worker_pool_size.max(1) as u32;
        match self.inner.permits.acquire_many(permits).await {
            Ok(all) => drop(all),
            Err(_) => debug!("Worker pool closed, no workers left to wait for"),
        }
    }

    /// Poll and wait for the dispatched jobs until a poll finds nothing to do
    pub async fn run_until_idle(&self) -> BatchResult<usize> {
        let mut total = 0;
        loop {
            let dispatched = self.poll_once().await?;
            self.wait_idle().await;
            if dispatched == 0 {
                return Ok(total);
            }
            total += dispatched;
        }
    }
}

impl Inner {
    fn next_delay(&self) -> Duration {
        let jitter = if self.config.poll_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.poll_jitter_ms)
        } else {
            0
        };
        self.config.poll_interval() + Duration::from_millis(jitter)
    }

    async fn poll(self: &Arc<Self>) -> BatchResult<usize> {
        let now = Utc::now();
        self.store.promote_ready(now).await?;

        let capacity = self
            .permits
            .available_permits()
            .min(self.config.batch_size);
        let mut dispatched = 0;

        if capacity > 0 {
            let candidates = self.store.fetch_dispatchable(now, capacity).await?;
            for job in candidates {
                if self.shutdown.is_shutdown_requested() {
                    break;
                }
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    break;
                };
                match self
                    .store
                    .claim(&job, &self.worker_id, self.config.lock_ttl(), Utc::now())
                    .await
                {
                    Ok(Some(claimed)) => {
                        tokio::spawn(self.clone().execute(claimed, permit));
                        dispatched += 1;
                    }
                    Ok(None) => debug!(job_id = %job.id, "Job claimed elsewhere"),
                    Err(e) => warn!(job_id = %job.id, error = %e, "Claim failed"),
                }
            }
        }

        metrics::set_queue_depth(self.store.queue_depth().await?);
        let mut stats = self.stats.write().await;
        stats.polls += 1;
        stats.jobs_claimed += dispatched as u64;
        stats.last_poll_at = Some(now);
        Ok(dispatched)
    }

    async fn execute(self: Arc<Self>, job: BatchJob, _permit: OwnedSemaphorePermit) {
        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_workers_active(active);

        let job_metrics = JobMetrics::start(job.id.clone(), self.worker_id.clone());
        let lock_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(job.id.clone(), lock_lost.clone());

        let span = info_span!(
            "batch_job",
            job_id = %job.id,
            attempt = job.attempt,
            worker_id = %self.worker_id
        );
        let result = self.process(&job, &lock_lost).instrument(span).await;
        heartbeat.abort();

        match result {
            Ok(Some(finished)) => {
                job_metrics.record_finished(
                    finished.status.as_str(),
                    finished.progress.succeeded,
                    finished.progress.failed,
                );
                self.record_stats(&finished).await;
            }
            Ok(None) => {}
            Err(e @ BatchError::LockLost { .. }) => {
                warn!(job_id = %job.id, error = %e, "Stopped job after losing its lock");
                job_metrics.record_failure(&e.to_string());
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job processing aborted");
                job_metrics.record_failure(&e.to_string());
            }
        }

        let active = self.active_workers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_workers_active(active);
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        job_id: String,
        lock_lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let interval = inner.config.heartbeat_interval();
            loop {
                tokio::time::sleep(interval).await;
                match inner
                    .store
                    .refresh_lock(&job_id, &inner.worker_id, inner.config.lock_ttl(), Utc::now())
                    .await
                {
                    Ok(()) => debug!(job_id = %job_id, "Lock refreshed"),
                    Err(BatchError::LockLost { .. }) => {
                        warn!(job_id = %job_id, "Lock lost");
                        lock_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Lock refresh failed"),
                }
            }
        })
    }

    /// One pass over the job's unfinished activities.
    ///
    /// Returns the job as left by [`BatchStore::finish`], or `None` when the
    /// job was handed back because of shutdown.
    async fn process(
        &self,
        job: &BatchJob,
        lock_lost: &AtomicBool,
    ) -> BatchResult<Option<BatchJob>> {
        let rows = self.store.pending_activities(&job.id).await?;
        info!(
            pending = rows.len(),
            total = job.activity_count,
            "Processing job"
        );

        let mut fatal: Option<ClassifiedError> = None;
        let mut deferred: Option<ClassifiedError> = None;
        let mut cancelled = false;

        // A fail-fast job that already recorded a failure before a crash
        // does not touch its remaining activities
        let halted = job.fail_fast && job.progress.failed > 0;

        for row in rows.iter().filter(|_| !halted) {
            if lock_lost.load(Ordering::SeqCst) {
                return Err(BatchError::LockLost {
                    job_id: job.id.clone(),
                    owner: self.worker_id.clone(),
                });
            }
            if self.shutdown.is_shutdown_requested() {
                self.store.release(&job.id, &self.worker_id).await?;
                info!("Released job on shutdown");
                return Ok(None);
            }
            if self.store.is_cancel_requested(&job.id).await? {
                info!(position = row.position, "Cancellation observed");
                cancelled = true;
                break;
            }

            match self.run_activity(job, &row.activity_id).await {
                Ok(emissions_kg) => {
                    debug!(activity_id = %row.activity_id, emissions_kg, "Activity calculated");
                    self.store
                        .record_activity_outcome(
                            &job.id,
                            &self.worker_id,
                            row.position,
                            &ActivityOutcome::Succeeded { emissions_kg },
                        )
                        .await?;
                }
                Err(err) if self.classifier.should_retry(&err, job.attempt) => {
                    warn!(activity_id = %row.activity_id, error = %err, "Activity deferred");
                    self.store
                        .record_activity_outcome(
                            &job.id,
                            &self.worker_id,
                            row.position,
                            &ActivityOutcome::Deferred {
                                class: err.class,
                                message: err.message.clone(),
                            },
                        )
                        .await?;
                    deferred = Some(err);
                }
                Err(err) => {
                    warn!(
                        activity_id = %row.activity_id,
                        error = %err,
                        suggestion = err.class.suggestion(),
                        "Activity failed"
                    );
                    self.store
                        .record_activity_outcome(
                            &job.id,
                            &self.worker_id,
                            row.position,
                            &ActivityOutcome::Failed {
                                class: err.class,
                                message: err.message.clone(),
                            },
                        )
                        .await?;
                    fatal.get_or_insert(err);
                    if job.fail_fast {
                        info!("Halting job at first non-retryable failure");
                        break;
                    }
                }
            }
        }

        let outcome = if cancelled {
            FinishOutcome::Cancelled
        } else if let Some(err) = fatal {
            FinishOutcome::Failed {
                class: err.class,
                message: err.message,
            }
        } else if let Some(first_failed) = self.earlier_failure(job).await? {
            first_failed
        } else if let Some(err) = deferred {
            if job.has_retries_left() {
                let delay = self.retry.delay_for(job.attempt);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                info!(
                    attempt = job.attempt + 1,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling job retry"
                );
                FinishOutcome::Retrying {
                    next_retry_at,
                    class: err.class,
                    message: err.message,
                }
            } else {
                FinishOutcome::Failed {
                    class: err.class,
                    message: format!(
                        "retries exhausted after {} attempts: {}",
                        job.attempt + 1,
                        err.message
                    ),
                }
            }
        } else {
            FinishOutcome::Completed
        };

        let finished = self
            .store
            .finish(&job.id, &self.worker_id, &outcome)
            .await?;
        info!(
            status = %finished.status,
            processed = finished.progress.processed,
            succeeded = finished.progress.succeeded,
            failed = finished.progress.failed,
            total_emissions_kg = finished.progress.total_emissions_kg,
            "Job pass finished"
        );
        Ok(Some(finished))
    }

    /// Failures recorded by an earlier pass (before a crash) still fail the job
    async fn earlier_failure(&self, job: &BatchJob) -> BatchResult<Option<FinishOutcome>> {
        let rows = self.store.activities(&job.id).await?;
        Ok(rows
            .into_iter()
            .find(|row| row.status == ActivityRunStatus::Failed)
            .map(|row| FinishOutcome::Failed {
                class: row.error_class.unwrap_or(ErrorClass::Unknown),
                message: row
                    .error_message
                    .unwrap_or_else(|| format!("activity {} failed", row.activity_id)),
            }))
    }

    async fn run_activity(&self, job: &BatchJob, activity_id: &str) -> Result<f64, ClassifiedError> {
        let deadline = self.config.activity_timeout();
        let work = async {
            let activity = self.activities.retrieve(activity_id).await?;
            if activity.org_id != job.org_id {
                return Err(ClassifiedError::bad_request(format!(
                    "activity {activity_id} belongs to another organization"
                )));
            }
            let emissions_kg = self.calculator.calculate(&activity).await?;
            if !emissions_kg.is_finite() || emissions_kg < 0.0 {
                return Err(ClassifiedError::bad_request(format!(
                    "calculator returned invalid emissions {emissions_kg} for {activity_id}"
                )));
            }
            Ok(emissions_kg)
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(ClassifiedError::transient(format!(
                "activity {activity_id} exceeded deadline of {deadline:?}"
            ))),
        }
    }

    async fn record_stats(&self, finished: &BatchJob) {
        let mut stats = self.stats.write().await;
        match finished.status {
            JobStatus::Completed => {
                stats.batches_processed += 1;
                stats.total_emissions_kg += finished.progress.total_emissions_kg;
            }
            JobStatus::Failed => stats.batches_failed += 1,
            JobStatus::Retrying => stats.batches_retried += 1,
            JobStatus::Cancelled => stats.batches_cancelled += 1,
            _ => {}
        }
    }
}
