//! Retry, backoff and token refresh against a stub emissions API

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use carbon_ingest::config::AzureConfig;
use carbon_ingest::connectors::{AzureConnector, IngestRequest, ProviderConnector};
use carbon_ingest::ingestion::{Jitter, RetryPolicy};
use carbon_ingest::shutdown::ShutdownCoordinator;
use carbon_ingest::ErrorClass;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::support::serve;

const EMISSIONS_PATH: &str =
    "/subscriptions/sub-1/providers/Microsoft.Sustainability/emissionsData";

#[derive(Clone, Default)]
struct Stub {
    tokens_issued: Arc<AtomicUsize>,
    emissions_calls: Arc<AtomicUsize>,
}

fn page() -> serde_json::Value {
    json!({
        "value": [{
            "id": "rec-1",
            "subscriptionId": "sub-1",
            "serviceName": "Virtual Machines",
            "resourceType": "Microsoft.Compute/virtualMachines",
            "region": "westeurope",
            "date": "2024-01-15",
            "totalCO2e": 12.5
        }],
        "nextLink": null
    })
}

async fn token(State(stub): State<Stub>) -> Json<serde_json::Value> {
    let n = stub.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "access_token": format!("token-{n}"), "expires_in": 3600, "token_type": "Bearer" }))
}

fn router(stub: Stub, emissions: axum::routing::MethodRouter<Stub>) -> Router {
    Router::new()
        .route("/tenant-1/oauth2/v2.0/token", post(token))
        .route(EMISSIONS_PATH, emissions)
        .with_state(stub)
}

fn connector(addr: SocketAddr, retry: RetryPolicy) -> AzureConnector {
    let base = format!("http://{addr}");
    let config = AzureConfig {
        tenant_id: "tenant-1".to_string(),
        client_id: "client".to_string(),
        client_secret: Some("secret".to_string()),
        subscription_id: "sub-1".to_string(),
        authority: Some(base.clone()),
        endpoint: Some(base),
        ..AzureConfig::default()
    };
    AzureConnector::new(&config, retry).unwrap()
}

fn policy(base_delay_ms: u64, max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay_ms,
        max_delay_ms: 1_000,
        max_retries,
        jitter: Jitter::None,
        retry_unknown: false,
    }
}

fn request() -> IngestRequest {
    IngestRequest::new(
        "org-1",
        "ws-1",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn test_rate_limited_twice_then_succeeds_after_backoff() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>| async move {
        let call = stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        if call < 2 {
            (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
        } else {
            Json(page()).into_response()
        }
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(40, 3));

    let started = Instant::now();
    let activities = connector
        .ingest(&request(), &ShutdownCoordinator::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(activities.len(), 1);
    assert!((activities[0].quantity - 12.5).abs() < 1e-9);
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 3);
    // two backoffs: 40 ms then 80 ms
    assert!(elapsed >= Duration::from_millis(120), "elapsed {elapsed:?}");
    assert_eq!(stub.tokens_issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exhausted_surface_transient_error() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>| async move {
        stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        (StatusCode::SERVICE_UNAVAILABLE, "maintenance")
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(1, 2));

    let err = connector
        .ingest(&request(), &ShutdownCoordinator::new())
        .await
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::Transient);
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_bad_request_is_not_retried() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>| async move {
        stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        (StatusCode::UNPROCESSABLE_ENTITY, "invalid filter")
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(1, 5));

    let err = connector
        .ingest(&request(), &ShutdownCoordinator::new())
        .await
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::BadRequest);
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>, headers: HeaderMap| async move {
        stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let response: Response = if auth == "Bearer token-1" {
            (StatusCode::UNAUTHORIZED, "token revoked").into_response()
        } else {
            Json(page()).into_response()
        };
        response
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(1, 3));

    let activities = connector
        .ingest(&request(), &ShutdownCoordinator::new())
        .await
        .unwrap();

    assert_eq!(activities.len(), 1);
    assert_eq!(stub.tokens_issued.load(Ordering::SeqCst), 2);
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_auth_failure_stops_after_one_refresh() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>| async move {
        stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        (StatusCode::FORBIDDEN, "no access")
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(1, 3));

    let err = connector
        .ingest(&request(), &ShutdownCoordinator::new())
        .await
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::Auth);
    assert_eq!(stub.tokens_issued.load(Ordering::SeqCst), 2);
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_aborts_backoff() {
    let stub = Stub::default();
    let emissions = get(|State(stub): State<Stub>| async move {
        stub.emissions_calls.fetch_add(1, Ordering::SeqCst);
        (StatusCode::TOO_MANY_REQUESTS, "slow down")
    });
    let addr = serve(router(stub.clone(), emissions)).await;
    let connector = connector(addr, policy(10_000, 5));
    let shutdown = ShutdownCoordinator::shared();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.request_shutdown();
    });

    let started = Instant::now();
    let result = connector.ingest(&request(), &shutdown).await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stub.emissions_calls.load(Ordering::SeqCst), 1);
}
