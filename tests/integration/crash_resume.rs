//! Resuming jobs whose worker died mid-run

use carbon_ingest::batch::{ActivityOutcome, JobStatus, SubmitJob};
use carbon_ingest::ErrorClass;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{fast_config, scheduler, seed, temp_store, ScriptedCalculator};

/// Claim `job_id` as a worker that then disappears, leaving a lock that
/// expires almost immediately
async fn crash_after_first_activity(
    store: &carbon_ingest::batch::BatchStore,
    job_id: &str,
    first: ActivityOutcome,
) {
    store.promote_ready(Utc::now()).await.unwrap();
    let job = store.get(job_id).await.unwrap();
    let claimed = store
        .claim(&job, "crashed-worker", Duration::from_millis(1), Utc::now())
        .await
        .unwrap()
        .expect("fresh job is claimable");
    store
        .record_activity_outcome(&claimed.id, "crashed-worker", 0, &first)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_resume_skips_finished_activities() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2", "a3"], 2.0).await;
    let job = store
        .create(&SubmitJob::new(
            "org-1",
            "ws-1",
            vec!["a1".into(), "a2".into(), "a3".into()],
        ))
        .await
        .unwrap();
    crash_after_first_activity(
        &store,
        &job.id,
        ActivityOutcome::Succeeded { emissions_kg: 2.0 },
    )
    .await;

    let calculator = Arc::new(ScriptedCalculator::new());
    let (survivor, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("survivor"),
    );
    assert_eq!(survivor.run_until_idle().await.unwrap(), 1);

    let detail = store.detail(&job.id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Completed);
    assert_eq!(detail.job.progress.processed, 3);
    assert_eq!(detail.job.progress.succeeded, 3);
    assert!((detail.job.progress.total_emissions_kg - 6.0).abs() < 1e-9);
    assert_eq!(calculator.calls(), vec!["a2".to_string(), "a3".to_string()]);

    let reclaim = detail
        .events
        .iter()
        .filter_map(|e| e.message.as_deref())
        .find(|m| m.starts_with("reclaimed by survivor"));
    assert!(reclaim.is_some(), "reclaim is logged: {:?}", detail.events);
}

#[tokio::test]
async fn test_resume_keeps_earlier_failure() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2"], 1.0).await;
    let job = store
        .create(&SubmitJob::new("org-1", "ws-1", vec!["a1".into(), "a2".into()]))
        .await
        .unwrap();
    crash_after_first_activity(
        &store,
        &job.id,
        ActivityOutcome::Failed {
            class: ErrorClass::BadRequest,
            message: "no emissions factor".into(),
        },
    )
    .await;

    let calculator = Arc::new(ScriptedCalculator::new());
    let (survivor, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("survivor"),
    );
    survivor.run_until_idle().await.unwrap();

    let job = store.get(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress.succeeded, 1);
    assert_eq!(job.progress.failed, 1);
    assert_eq!(job.last_error_class, Some(ErrorClass::BadRequest));
}

#[tokio::test]
async fn test_resume_of_fail_fast_job_does_not_continue() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2"], 1.0).await;
    let job = store
        .create(
            &SubmitJob::new("org-1", "ws-1", vec!["a1".into(), "a2".into()])
                .with_fail_fast(true),
        )
        .await
        .unwrap();
    crash_after_first_activity(
        &store,
        &job.id,
        ActivityOutcome::Failed {
            class: ErrorClass::Fatal,
            message: "calculator crashed".into(),
        },
    )
    .await;

    let calculator = Arc::new(ScriptedCalculator::new());
    let (survivor, _shutdown) = scheduler(
        &store,
        activities,
        calculator.clone(),
        fast_config("survivor"),
    );
    survivor.run_until_idle().await.unwrap();

    assert_eq!(store.get(&job.id).await.unwrap().status, JobStatus::Failed);
    assert!(calculator.calls().is_empty());
}

#[tokio::test]
async fn test_stale_worker_cannot_write_after_reclaim() {
    let (store, _dir) = temp_store().await;
    let job = store
        .create(&SubmitJob::new("org-1", "ws-1", vec!["a1".into(), "a2".into()]))
        .await
        .unwrap();
    crash_after_first_activity(
        &store,
        &job.id,
        ActivityOutcome::Succeeded { emissions_kg: 1.0 },
    )
    .await;

    let stale = store.get(&job.id).await.unwrap();
    let taken = store
        .claim(&stale, "survivor", Duration::from_secs(30), Utc::now())
        .await
        .unwrap();
    assert!(taken.is_some());

    let err = store
        .record_activity_outcome(
            &job.id,
            "crashed-worker",
            1,
            &ActivityOutcome::Succeeded { emissions_kg: 1.0 },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        carbon_ingest::batch::BatchError::LockLost { .. }
    ));
    assert_eq!(store.get(&job.id).await.unwrap().progress.processed, 1);
}

#[tokio::test]
async fn test_poll_after_shutdown_claims_nothing() {
    let (store, _dir) = temp_store().await;
    let activities = seed(&store, &["a1", "a2"], 1.0).await;
    let job = store
        .create(&SubmitJob::new("org-1", "ws-1", vec!["a1".into(), "a2".into()]))
        .await
        .unwrap();

    let calculator = Arc::new(ScriptedCalculator::new());
    let (worker, shutdown) = scheduler(
        &store,
        activities.clone(),
        calculator.clone(),
        fast_config("leaving"),
    );
    shutdown.request_shutdown();
    // a poll after shutdown claims nothing
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(store.get(&job.id).await.unwrap().status, JobStatus::Queued);

    let (next, _shutdown) = scheduler(&store, activities, calculator, fast_config("next"));
    next.run_until_idle().await.unwrap();
    assert_eq!(store.get(&job.id).await.unwrap().status, JobStatus::Completed);
}
