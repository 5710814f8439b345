//! Ingest, store and submit through the pipeline

use async_trait::async_trait;
use carbon_ingest::batch::{BatchService, JobStatus};
use carbon_ingest::collaborators::{ActivityStore, MemoryActivityStore, SqliteActivityStore};
use carbon_ingest::connectors::{
    AuthRequest, ConnectorResult, ConnectorSet, IngestRequest, Provider, ProviderConnector,
};
use carbon_ingest::pipeline::{IngestionPipeline, PipelineError, SubmitOptions};
use carbon_ingest::shutdown::ShutdownCoordinator;
use carbon_ingest::{Activity, ClassifiedError, ErrorClass};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::support::{activity, fast_config, scheduler, temp_store, ScriptedCalculator};

/// Connector returning a fixed result
struct FixedConnector {
    provider: Provider,
    result: Result<Vec<Activity>, ErrorClass>,
    calls: AtomicUsize,
}

impl FixedConnector {
    fn returning(activities: Vec<Activity>) -> Arc<Self> {
        Arc::new(Self {
            provider: Provider::Azure,
            result: Ok(activities),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(class: ErrorClass) -> Arc<Self> {
        Arc::new(Self {
            provider: Provider::Azure,
            result: Err(class),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProviderConnector for FixedConnector {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn ingest(
        &self,
        _request: &IngestRequest,
        _cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(activities) => Ok(activities.clone()),
            Err(class) => Err(ClassifiedError::new(*class, "stub failure")),
        }
    }

    async fn get_auth_header(
        &self,
        _request: &AuthRequest<'_>,
        _cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<String> {
        Ok("Bearer stub".to_string())
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

fn connectors(connector: Arc<FixedConnector>) -> ConnectorSet {
    let mut set = ConnectorSet::new();
    set.insert(connector);
    set
}

#[tokio::test]
async fn test_ingest_store_submit_and_process() {
    let (store, _dir) = temp_store().await;
    let activities = Arc::new(SqliteActivityStore::new(store.pool().clone()));
    let connector = FixedConnector::returning(vec![
        activity("az-1", "org-1", 4.0),
        activity("az-2", "org-1", 6.0),
    ]);
    let pipeline = IngestionPipeline::new(
        connectors(connector.clone()),
        activities.clone(),
        BatchService::new(store.clone()),
    );

    let options = SubmitOptions {
        submit: true,
        priority: Some(7),
        ..SubmitOptions::default()
    };
    let report = pipeline
        .run(Provider::Azure, &request(), &options, &ShutdownCoordinator::new())
        .await
        .unwrap();

    assert_eq!(report.provider, Provider::Azure);
    assert_eq!(report.activity_ids, vec!["az-1", "az-2"]);
    assert!(activities.retrieve("az-2").await.is_ok());

    let job_id = report.job_id.expect("job submitted");
    let job = store.get(&job_id).await.unwrap();
    assert_eq!(job.priority, 7);
    assert_eq!(job.activity_count, 2);

    let (scheduler, _shutdown) = scheduler(
        &store,
        activities,
        Arc::new(ScriptedCalculator::new()),
        fast_config("worker-a"),
    );
    scheduler.run_until_idle().await.unwrap();
    let done = store.get(&job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!((done.progress.total_emissions_kg - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_without_submit_only_stores() {
    let (store, _dir) = temp_store().await;
    let activities = Arc::new(MemoryActivityStore::new());
    let pipeline = IngestionPipeline::new(
        connectors(FixedConnector::returning(vec![activity("az-1", "org-1", 1.0)])),
        activities.clone(),
        BatchService::new(store.clone()),
    );

    let report = pipeline
        .run(
            Provider::Azure,
            &request(),
            &SubmitOptions::default(),
            &ShutdownCoordinator::new(),
        )
        .await
        .unwrap();

    assert!(report.job_id.is_none());
    assert_eq!(activities.len().await, 1);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_ingest_submits_nothing() {
    let (store, _dir) = temp_store().await;
    let pipeline = IngestionPipeline::new(
        connectors(FixedConnector::returning(Vec::new())),
        Arc::new(MemoryActivityStore::new()),
        BatchService::new(store.clone()),
    );
    let options = SubmitOptions {
        submit: true,
        ..SubmitOptions::default()
    };

    let report = pipeline
        .run(Provider::Azure, &request(), &options, &ShutdownCoordinator::new())
        .await
        .unwrap();

    assert!(report.activity_ids.is_empty());
    assert!(report.job_id.is_none());
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_connector_failure_stores_nothing() {
    let (store, _dir) = temp_store().await;
    let activities = Arc::new(MemoryActivityStore::new());
    let pipeline = IngestionPipeline::new(
        connectors(FixedConnector::failing(ErrorClass::Auth)),
        activities.clone(),
        BatchService::new(store),
    );

    let err = pipeline
        .run(
            Provider::Azure,
            &request(),
            &SubmitOptions::default(),
            &ShutdownCoordinator::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Ingest(ref e) if e.class == ErrorClass::Auth));
    assert!(activities.is_empty().await);
}

#[tokio::test]
async fn test_store_failure_submits_no_job() {
    let (store, _dir) = temp_store().await;
    let activities = Arc::new(MemoryActivityStore::new());
    activities.store(&activity("az-1", "org-1", 1.0)).await.unwrap();
    let pipeline = IngestionPipeline::new(
        connectors(FixedConnector::returning(vec![
            activity("az-0", "org-1", 1.0),
            activity("az-1", "org-1", 1.0),
        ])),
        activities.clone(),
        BatchService::new(store.clone()),
    );
    let options = SubmitOptions {
        submit: true,
        ..SubmitOptions::default()
    };

    let err = pipeline
        .run(Provider::Azure, &request(), &options, &ShutdownCoordinator::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Store(_)));
    assert_eq!(activities.len().await, 1);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unconfigured_provider_and_bad_window() {
    let (store, _dir) = temp_store().await;
    let connector = FixedConnector::returning(Vec::new());
    let pipeline = IngestionPipeline::new(
        connectors(connector.clone()),
        Arc::new(MemoryActivityStore::new()),
        BatchService::new(store),
    );
    let cancel = ShutdownCoordinator::new();

    let err = pipeline
        .run(Provider::Gcp, &request(), &SubmitOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotConfigured(Provider::Gcp)));

    let mut inverted = request();
    std::mem::swap(&mut inverted.period_start, &mut inverted.period_end);
    let err = pipeline
        .run(Provider::Azure, &inverted, &SubmitOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Ingest(ref e) if e.class == ErrorClass::BadRequest));
    assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
}
