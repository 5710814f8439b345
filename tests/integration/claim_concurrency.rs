//! Several schedulers sharing one database

use carbon_ingest::batch::{JobStatus, SubmitJob};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{fast_config, scheduler, seed, temp_store, ScriptedCalculator};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let (store, _dir) = temp_store().await;
    let job = store
        .create(&SubmitJob::new("org-1", "ws-1", vec!["a1".into()]))
        .await
        .unwrap();
    store.promote_ready(Utc::now()).await.unwrap();
    let queued = store.get(&job.id).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let queued = queued.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim(&queued, &format!("worker-{i}"), Duration::from_secs(30), Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let claims = store
        .events(&job.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.to_status == JobStatus::Processing)
        .count();
    assert_eq!(claims, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_schedulers_process_each_job_once() {
    let (store, _dir) = temp_store().await;
    let ids: Vec<String> = (0..6).map(|i| format!("act-{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let activities = seed(&store, &id_refs, 1.0).await;

    let mut job_ids = Vec::new();
    for id in &ids {
        let job = store
            .create(&SubmitJob::new("org-1", "ws-1", vec![id.clone()]))
            .await
            .unwrap();
        job_ids.push(job.id);
    }

    let calculator = Arc::new(ScriptedCalculator::new());
    let (first, _s1) = scheduler(
        &store,
        activities.clone(),
        calculator.clone(),
        fast_config("node-a"),
    );
    let (second, _s2) = scheduler(&store, activities, calculator.clone(), fast_config("node-b"));

    let (a, b) = tokio::join!(first.run_until_idle(), second.run_until_idle());
    assert_eq!(a.unwrap() + b.unwrap(), 6);

    for job_id in &job_ids {
        assert_eq!(store.get(job_id).await.unwrap().status, JobStatus::Completed);
    }
    let calls = calculator.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls.iter().collect::<HashSet<_>>().len(), 6);
}
