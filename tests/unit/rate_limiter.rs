//! Token bucket behaviour under concurrency, on a paused clock

use carbon_ingest::ingestion::RateLimiter;
use carbon_ingest::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_bucket() {
    let limiter = Arc::new(RateLimiter::with_min_wait(
        "shared",
        5.0,
        5.0,
        Duration::from_millis(10),
    ));
    let cancel = ShutdownCoordinator::shared();
    let started = Instant::now();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter.allow(&cancel).await.unwrap();
                started.elapsed()
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for handle in handles {
        admitted.push(handle.await.unwrap());
    }
    admitted.sort();

    // the burst goes out at once
    assert_eq!(admitted.iter().filter(|t| t.is_zero()).count(), 5);
    // afterwards one token per 200 ms
    for (i, at) in admitted.iter().enumerate().skip(5) {
        let earliest = Duration::from_millis(200 * (i as u64 - 4));
        assert!(
            *at + Duration::from_millis(1) >= earliest,
            "caller {i} admitted at {at:?}, before {earliest:?}"
        );
    }
    assert!(admitted[19] >= Duration::from_millis(2_999));
    assert!(admitted[19] < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_try_allow_refills_with_time() {
    let limiter = RateLimiter::new("refill", 2.0, 4.0);
    assert!(limiter.try_allow());
    assert!(limiter.try_allow());
    assert!(!limiter.try_allow());

    tokio::time::advance(Duration::from_millis(250)).await;
    assert!(limiter.try_allow());
    assert!(!limiter.try_allow());

    // never above capacity however long it idles
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!((limiter.available() - 2.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_waiters() {
    let limiter = Arc::new(RateLimiter::new("slow", 1.0, 0.01));
    let cancel = ShutdownCoordinator::shared();
    assert!(limiter.try_allow());

    let waiter = tokio::spawn({
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        async move { limiter.allow(&cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.request_shutdown();

    assert!(waiter.await.unwrap().is_err());
}
