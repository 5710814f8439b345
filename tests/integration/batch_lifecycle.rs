//! End-to-end batch processing through the scheduler

use carbon_ingest::batch::{ActivityRunStatus, BatchService, JobStatus, SubmitJob};
use carbon_ingest::ErrorClass;
use std::sync::Arc;

use crate::support::{fast_config, scheduler, seed, temp_store, ScriptedCalculator};

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_three_activities_complete() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2", "a3"], 2.5).await;
    let calculator = Arc::new(ScriptedCalculator::new());
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
    assert_eq!(scheduler.run_until_idle().await.unwrap(), 1);

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Completed);
    assert_eq!(detail.job.progress.processed, 3);
    assert_eq!(detail.job.progress.succeeded, 3);
    assert_eq!(detail.job.progress.failed, 0);
    assert!((detail.job.progress.total_emissions_kg - 7.5).abs() < 1e-9);
    assert!(detail.job.lock_owner.is_none());
    assert!(detail.job.completed_at.is_some());
    assert_eq!(
        detail.status_history(),
        vec![
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed
        ]
    );
    assert!(detail
        .activities
        .iter()
        .all(|a| a.status == ActivityRunStatus::Succeeded && a.emissions_kg == Some(2.5)));
    assert_eq!(calculator.calls(), ids(&["a1", "a2", "a3"]));

    let stats = scheduler.stats().await;
    assert_eq!(stats.batches_processed, 1);
    assert_eq!(stats.jobs_claimed, 1);
}

#[tokio::test]
async fn test_best_effort_records_failure_and_continues() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2", "a3"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new().fail("a2", &[ErrorClass::Fatal]));
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone());

    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "a2", "a3"])).with_fail_fast(false))
        .await
        .unwrap();
    scheduler.run_until_idle().await.unwrap();

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Failed);
    assert_eq!(detail.job.progress.succeeded, 2);
    assert_eq!(detail.job.progress.failed, 1);
    assert_eq!(detail.job.last_error_class, Some(ErrorClass::Fatal));
    assert_eq!(detail.job.attempt, 0);
    assert_eq!(calculator.calls(), ids(&["a1", "a2", "a3"]));

    let failed = &detail.activities[1];
    assert_eq!(failed.status, ActivityRunStatus::Failed);
    assert_eq!(failed.error_class, Some(ErrorClass::Fatal));
    assert_eq!(detail.activities[2].status, ActivityRunStatus::Succeeded);
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_failure() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2", "a3"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new().fail("a2", &[ErrorClass::Fatal]));
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone());

    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "a2", "a3"])).with_fail_fast(true))
        .await
        .unwrap();
    scheduler.run_until_idle().await.unwrap();

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Failed);
    assert_eq!(detail.job.progress.succeeded, 1);
    assert_eq!(detail.job.progress.failed, 1);
    assert_eq!(detail.job.last_error_class, Some(ErrorClass::Fatal));
    assert_eq!(calculator.call_count("a2"), 1);
    assert_eq!(calculator.call_count("a3"), 0);
    assert_eq!(detail.activities[2].status, ActivityRunStatus::Pending);
}

#[tokio::test]
async fn test_transient_failure_retries_job() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new().fail("a2", &[ErrorClass::Transient]));
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone());

    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "a2"])).with_max_retries(3))
        .await
        .unwrap();
    assert_eq!(scheduler.run_until_idle().await.unwrap(), 2);

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Completed);
    assert_eq!(detail.job.attempt, 1);
    assert_eq!(detail.job.progress.succeeded, 2);
    // the succeeded activity is not recalculated on the retry pass
    assert_eq!(calculator.call_count("a1"), 1);
    assert_eq!(calculator.call_count("a2"), 2);
    assert_eq!(detail.activities[1].attempts, 2);
    assert_eq!(
        detail.status_history(),
        vec![
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Retrying,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed
        ]
    );
    assert_eq!(scheduler.stats().await.batches_retried, 1);
}

#[tokio::test]
async fn test_retries_exhausted_fails_job() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new().fail("a1", &[ErrorClass::Transient; 5]));
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone());

    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1"])).with_max_retries(1))
        .await
        .unwrap();
    scheduler.run_until_idle().await.unwrap();

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Failed);
    assert_eq!(calculator.call_count("a1"), 2);
    assert_eq!(detail.job.last_error_class, Some(ErrorClass::Transient));
    assert!(detail
        .job
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("retries exhausted"));
}

#[tokio::test]
async fn test_missing_activity_fails_without_retry() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new());
    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("worker-a"),
    );
    let service = BatchService::new(store.clone());

    let job_id = service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["a1", "ghost"])))
        .await
        .unwrap();
    scheduler.run_until_idle().await.unwrap();

    let detail = service.get(&job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Failed);
    assert_eq!(detail.activities[1].error_class, Some(ErrorClass::NotFound));
    assert_eq!(detail.job.attempt, 0);
    assert_eq!(calculator.calls(), ids(&["a1"]));
}

#[tokio::test]
async fn test_priority_orders_dispatch() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["low", "high"], 1.0).await;
    let calculator = Arc::new(ScriptedCalculator::new());
    let config = carbon_ingest::batch::SchedulerConfig {
        worker_pool_size: 1,
        batch_size: 1,
        ..fast_config("worker-a")
    };
    let (scheduler, _shutdown) = scheduler(&store, activities, calculator.clone(), config);
    let service = BatchService::new(store.clone());

    service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["low"])).with_priority(1))
        .await
        .unwrap();
    service
        .submit(SubmitJob::new("org-1", "ws-1", ids(&["high"])).with_priority(9))
        .await
        .unwrap();

    assert_eq!(scheduler.run_until_idle().await.unwrap(), 2);
    assert_eq!(calculator.calls(), ids(&["high", "low"]));
}
