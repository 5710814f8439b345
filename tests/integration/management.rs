//! Cancel, retry and health through the management service

use async_trait::async_trait;
use carbon_ingest::batch::{
    ActivityRunStatus, BatchError, BatchService, HealthStatus, JobFilter, JobStatus, SubmitJob,
};
use carbon_ingest::collaborators::EmissionsCalculator;
use carbon_ingest::{Activity, ClassifiedError, ErrorClass};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::support::{fast_config, scheduler, seed, temp_store, ScriptedCalculator};

/// Blocks on the first activity until released
#[derive(Default)]
struct GatedCalculator {
    entered: Notify,
    release: Notify,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl EmissionsCalculator for GatedCalculator {
    async fn calculate(&self, activity: &Activity) -> Result<f64, ClassifiedError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(activity.id.clone());
            calls.len() == 1
        };
        if first {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(activity.quantity)
    }
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_cancel_queued_job_is_immediate() {
    let (store, _dir) = temp_store().await;
    let service = BatchService::new(store.clone());
    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1"])))
        .await
        .unwrap();

    let detail = service.cancel(&job_id).await.unwrap();

    assert_eq!(detail.job.status, JobStatus::Cancelled);
    assert!(detail.job.completed_at.is_some());
    let last = detail.events.last().unwrap();
    assert_eq!(last.from_status, Some(JobStatus::Pending));
    assert_eq!(last.to_status, JobStatus::Cancelled);

    // terminal jobs cannot be cancelled again
    let err = service.cancel(&job_id).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::InvalidTransition { from: JobStatus::Cancelled, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_processing_job_stops_at_next_activity() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2", "a3"], 1.0).await;
    let calculator = Arc::new(GatedCalculator::default());
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone()).with_scheduler(scheduler.clone());
    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "a2", "a3"])))
        .await
        .unwrap();

    let run = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_until_idle().await }
    });
    tokio::time::timeout(Duration::from_secs(5), calculator.entered.notified())
        .await
        .unwrap();

    let requested = service.cancel(&job_id).await.unwrap();
    assert_eq!(requested.job.status, JobStatus::Processing);
    assert!(requested.job.cancel_requested);

    calculator.release.notify_one();
    run.await.unwrap().unwrap();

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Cancelled);
    assert_eq!(*calculator.calls.lock().unwrap(), vec!["a1".to_string()]);
    assert_eq!(detail.activities[0].status, ActivityRunStatus::Succeeded);
    assert_eq!(detail.activities[1].status, ActivityRunStatus::Pending);
    assert!(detail.job.lock_owner.is_none());
}

#[tokio::test]
async fn test_retry_failed_job_keeps_successes() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2"], 2.0).await;
    let calculator = Arc::new(ScriptedCalculator::new().fail("a2", &[ErrorClass::BadRequest]));
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone()).with_scheduler(scheduler.clone());
    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "a2"])))
        .await
        .unwrap();

    scheduler.run_until_idle().await.unwrap();
    assert_eq!(service.get(&job_id).await.unwrap().job.status, JobStatus::Failed);

    let requeued = service.retry(&job_id).await.unwrap();
    assert_eq!(requeued.job.status, JobStatus::Queued);
    assert_eq!(requeued.job.attempt, 0);
    assert_eq!(requeued.job.progress.failed, 0);
    assert_eq!(requeued.job.remaining(), 1);

    scheduler.run_until_idle().await.unwrap();
    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Completed);
    assert_eq!(calculator.call_count("a1"), 1);
    assert_eq!(calculator.call_count("a2"), 2);
    assert!((detail.job.progress.total_emissions_kg - 4.0).abs() < 1e-9);

    let err = service.retry(&job_id).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::InvalidTransition { from: JobStatus::Completed, .. }
    ));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (store, _dir) = temp_store().await;
    let service = BatchService::new(store);

    assert!(matches!(
        service.get("job_missing").await,
        Err(BatchError::NotFound(_))
    ));
    assert!(matches!(
        service.cancel("job_missing").await,
        Err(BatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_health_reports_queue_and_scheduler() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1"], 1.5).await;
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        Arc::new(ScriptedCalculator::new()),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone()).with_scheduler(scheduler.clone());

    service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1"])))
        .await
        .unwrap();
    service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1"])))
        .await
        .unwrap();

    let before = service.health().await.unwrap();
    assert_eq!(before.status, HealthStatus::Healthy);
    assert_eq!(before.queue_depth, 2);
    assert!(!before.scheduler_running);
    assert_eq!(before.jobs_by_status, vec![(JobStatus::Pending, 2)]);

    scheduler.run_until_idle().await.unwrap();

    let after = service.health().await.unwrap();
    assert_eq!(after.queue_depth, 0);
    assert_eq!(after.batches_processed, 2);
    assert!((after.total_emissions_kg - 3.0).abs() < 1e-9);
    assert!(after.last_poll_at.is_some());
    assert_eq!(after.jobs_by_status, vec![(JobStatus::Completed, 2)]);
}

#[tokio::test]
async fn test_list_filters_by_org_and_status() {
    let (store, _dir) = temp_store().await;
    let service = BatchService::new(store.clone());
    for org in ["org-1", "org-1", "org-2"] {
        service
            .submit(SubmitJob::new(org, "ws-1", ids(&["a1"])))
            .await
            .unwrap();
    }
    let first = service
        .list(&JobFilter {
            org_id: Some("org-1".to_string()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    service.cancel(&first.jobs[0].id).await.unwrap();

    let org1 = service
        .list(&JobFilter {
            org_id: Some("org-1".to_string()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(org1.total, 2);

    let cancelled = service
        .list(&JobFilter {
            status: Some(JobStatus::Cancelled),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(cancelled.total, 1);
    assert_eq!(cancelled.jobs[0].org_id, "org-1");

    let paged = service
        .list(&JobFilter {
            limit: 1,
            offset: 2,
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(paged.total, 3);
    assert_eq!(paged.jobs.len(), 1);
}
