//! Worker and job management commands

use clap::Args;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use super::{CliError, Output};
use crate::batch::{
    BatchScheduler, BatchService, BatchStore, HealthReport, JobDetail, JobFilter, JobPage,
    JobStatus, SubmitJob,
};
use crate::collaborators::{ReportedEmissionsCalculator, SqliteActivityStore};
use crate::config::AppConfig;
use crate::shutdown::SharedShutdown;

/// Worker command arguments
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Lock owner name; overrides `scheduler.worker_id`
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Process everything that is ready, then exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

impl WorkerArgs {
    /// Execute the worker command
    pub async fn execute(
        &self,
        config: &AppConfig,
        store: BatchStore,
        shutdown: SharedShutdown,
        out: Output,
    ) -> Result<(), CliError> {
        let mut scheduler_config = config.scheduler.clone();
        if let Some(id) = &self.worker_id {
            scheduler_config.worker_id = Some(id.clone());
        }

        let activities = Arc::new(SqliteActivityStore::new(store.pool().clone()));
        let scheduler = BatchScheduler::new(
            store,
            activities,
            Arc::new(ReportedEmissionsCalculator),
            scheduler_config,
            shutdown,
        );

        if self.once {
            let dispatched = scheduler.run_until_idle().await?;
            info!(dispatched, "Worker drained the queue");
        } else {
            scheduler.run().await?;
        }

        let stats = scheduler.stats().await;
        out.emit(&stats, |s| {
            format!(
                "Worker {}: {} claimed, {} completed, {} failed, {} retried, {} cancelled, {:.3} kg CO2e",
                scheduler.worker_id(),
                s.jobs_claimed,
                s.batches_processed,
                s.batches_failed,
                s.batches_retried,
                s.batches_cancelled,
                s.total_emissions_kg
            )
        })
    }
}

/// Submit command arguments
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Organization
    #[arg(long)]
    pub org: String,

    /// Workspace
    #[arg(long)]
    pub workspace: String,

    /// Activity id; repeat for several, processed in the given order
    #[arg(long = "activity", required = true)]
    pub activities: Vec<String>,

    /// Job priority; higher runs first
    #[arg(long, default_value_t = crate::batch::job::DEFAULT_PRIORITY)]
    pub priority: i64,

    /// Job-level retry budget
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Stop at the first non-retryable activity failure
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,
}

impl SubmitArgs {
    /// Execute the submit command
    pub async fn execute(
        &self,
        config: &AppConfig,
        store: BatchStore,
        out: Output,
    ) -> Result<(), CliError> {
        let service = service(config, store);
        let mut request = SubmitJob::new(&self.org, &self.workspace, self.activities.clone())
            .with_priority(self.priority);
        request.max_retries = self.max_retries;
        if self.fail_fast {
            request = request.with_fail_fast(true);
        }
        let job_id = service.submit(request).await?;
        out.emit(&serde_json::json!({ "job_id": job_id.as_str() }), |_| {
            format!("Submitted {job_id}")
        })
    }
}

/// List command arguments
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only jobs of this organization
    #[arg(long)]
    pub org: Option<String>,

    /// Only jobs in this status
    #[arg(long)]
    pub status: Option<JobStatus>,

    /// Page size (max 500)
    #[arg(long, default_value_t = crate::batch::job::DEFAULT_LIST_LIMIT)]
    pub limit: u32,

    /// Rows to skip
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

impl ListArgs {
    /// Execute the list command
    pub async fn execute(
        &self,
        config: &AppConfig,
        store: BatchStore,
        out: Output,
    ) -> Result<(), CliError> {
        let filter = JobFilter {
            org_id: self.org.clone(),
            status: self.status,
            limit: self.limit,
            offset: self.offset,
        };
        let page = service(config, store).list(&filter).await?;
        out.emit(&page, render_page)
    }
}

/// Show one job
pub async fn status(
    config: &AppConfig,
    store: BatchStore,
    job_id: &str,
    out: Output,
) -> Result<(), CliError> {
    let detail = service(config, store).get(job_id).await?;
    out.emit(&detail, render_detail)
}

/// Cancel one job
pub async fn cancel(
    config: &AppConfig,
    store: BatchStore,
    job_id: &str,
    out: Output,
) -> Result<(), CliError> {
    let detail = service(config, store).cancel(job_id).await?;
    out.emit(&detail, |d| {
        if d.job.status == JobStatus::Cancelled {
            format!("Cancelled {}", d.job.id)
        } else {
            format!(
                "Cancellation requested for {}; it stops at the next activity",
                d.job.id
            )
        }
    })
}

/// Re-queue one failed job
pub async fn retry(
    config: &AppConfig,
    store: BatchStore,
    job_id: &str,
    out: Output,
) -> Result<(), CliError> {
    let detail = service(config, store).retry(job_id).await?;
    out.emit(&detail, |d| {
        format!(
            "Re-queued {} with {} activities left",
            d.job.id,
            d.job.remaining()
        )
    })
}

/// Report health
pub async fn health(config: &AppConfig, store: BatchStore, out: Output) -> Result<(), CliError> {
    let report = service(config, store).health().await?;
    out.emit(&report, render_health)
}

fn service(config: &AppConfig, store: BatchStore) -> BatchService {
    BatchService::new(store).with_defaults(config.scheduler.clone())
}

fn render_page(page: &JobPage) -> String {
    let mut s = String::new();
    for job in &page.jobs {
        let _ = writeln!(
            s,
            "{:<38} {:<10} {:>3}  {}/{} processed  {:>10.3} kg  {}",
            job.id,
            job.status.as_str(),
            job.priority,
            job.progress.processed,
            job.activity_count,
            job.progress.total_emissions_kg,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let _ = write!(
        s,
        "{} of {} jobs (offset {})",
        page.jobs.len(),
        page.total,
        page.offset
    );
    s
}

fn render_detail(detail: &JobDetail) -> String {
    let job = &detail.job;
    let mut s = String::new();
    let _ = writeln!(s, "Job {}", job.id);
    let _ = writeln!(s, "  status:     {}", job.status);
    let _ = writeln!(s, "  tenant:     {}/{}", job.org_id, job.workspace_id);
    let _ = writeln!(
        s,
        "  attempt:    {}/{} (priority {}, {})",
        job.attempt,
        job.max_retries,
        job.priority,
        if job.fail_fast { "fail-fast" } else { "best-effort" }
    );
    let _ = writeln!(
        s,
        "  progress:   {}/{} processed, {} succeeded, {} failed ({:.1}%)",
        job.progress.processed,
        job.activity_count,
        job.progress.succeeded,
        job.progress.failed,
        job.progress_ratio() * 100.0
    );
    let _ = writeln!(s, "  emissions:  {:.3} kg CO2e", job.progress.total_emissions_kg);
    if let Some(error) = &job.last_error {
        let class = job.last_error_class.map(|c| c.as_str()).unwrap_or("unknown");
        let _ = writeln!(s, "  last error: [{class}] {error}");
    }
    if let Some(at) = job.next_retry_at {
        let _ = writeln!(s, "  next retry: {}", at.to_rfc3339());
    }

    let _ = writeln!(s, "Activities:");
    for activity in &detail.activities {
        let result = match (activity.emissions_kg, &activity.error_message) {
            (Some(kg), _) => format!("{kg:.3} kg"),
            (None, Some(message)) => message.clone(),
            (None, None) => String::new(),
        };
        let _ = writeln!(
            s,
            "  #{:<3} {:<38} {:<9} {}",
            activity.position,
            activity.activity_id,
            activity.status.as_str(),
            result
        );
    }

    let _ = write!(s, "Transitions:");
    for event in &detail.events {
        let from = event.from_status.map(|f| f.as_str()).unwrap_or("-");
        let _ = write!(
            s,
            "\n  {} {} -> {} {}",
            event.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            from,
            event.to_status,
            event.message.as_deref().unwrap_or("")
        );
    }
    s
}

fn render_health(report: &HealthReport) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "status:            {:?}", report.status);
    let _ = writeln!(s, "queue depth:       {}", report.queue_depth);
    let _ = writeln!(s, "scheduler running: {}", report.scheduler_running);
    let _ = write!(s, "workers active:    {}", report.workers_active);
    for (status, count) in &report.jobs_by_status {
        let _ = write!(s, "\n  {:<10} {count}", status.as_str());
    }
    s
}
