//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use carbon_ingest::batch::{BatchScheduler, BatchStore, SchedulerConfig};
use carbon_ingest::collaborators::{ActivityStore, EmissionsCalculator, SqliteActivityStore};
use carbon_ingest::shutdown::{ShutdownCoordinator, SharedShutdown};
use carbon_ingest::{
    Activity, ActivitySource, Category, ClassifiedError, DataQuality, ErrorClass, Unit,
};
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// File-backed store in a fresh temp directory; keep the dir alive
pub async fn temp_store() -> (BatchStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("carbon.db").display());
    let store = BatchStore::connect(&url).await.unwrap();
    (store, dir)
}

/// Activity already expressed in kg CO2e
pub fn activity(id: &str, org_id: &str, kg: f64) -> Activity {
    Activity {
        id: id.to_string(),
        org_id: org_id.to_string(),
        workspace_id: "ws-1".to_string(),
        source: ActivitySource::CloudA,
        category: Category::Compute,
        quantity: kg,
        unit: Unit::KgCo2e,
        region: "US-EAST".to_string(),
        period_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        period_end: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        raw_metadata: BTreeMap::new(),
        external_id: None,
        data_quality: DataQuality::Measured,
        created_at: Utc::now(),
    }
}

/// Store `ids` for `org-1`, each worth `kg`, in the batch database
pub async fn seed(store: &BatchStore, ids: &[&str], kg: f64) -> Arc<SqliteActivityStore> {
    let activities = Arc::new(SqliteActivityStore::new(store.pool().clone()));
    let records: Vec<Activity> = ids.iter().map(|id| activity(id, "org-1", kg)).collect();
    activities.store_many(&records).await.unwrap();
    activities
}

/// Scheduler settings for tests: no poll jitter, immediate job retries
pub fn fast_config(worker_id: &str) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 10,
        poll_jitter_ms: 0,
        worker_pool_size: 2,
        lock_ttl_ms: 30_000,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        activity_timeout_ms: 5_000,
        worker_id: Some(worker_id.to_string()),
        ..SchedulerConfig::default()
    }
}

/// Scheduler over `store` with the given collaborators
pub fn scheduler(
    store: &BatchStore,
    activities: Arc<dyn ActivityStore>,
    calculator: Arc<dyn EmissionsCalculator>,
    config: SchedulerConfig,
) -> (BatchScheduler, SharedShutdown) {
    let shutdown = ShutdownCoordinator::shared();
    let scheduler = BatchScheduler::new(
        store.clone(),
        activities,
        calculator,
        config,
        shutdown.clone(),
    );
    (scheduler, shutdown)
}

/// Calculator with per-activity scripted failures.
///
/// Each scripted activity fails with the queued classes in order, then falls
/// through to the reported quantity.
#[derive(Default)]
pub struct ScriptedCalculator {
    script: Mutex<HashMap<String, VecDeque<ErrorClass>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `activity_id` with `classes`, one per call
    pub fn fail(self, activity_id: &str, classes: &[ErrorClass]) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(activity_id.to_string(), classes.iter().copied().collect());
        self
    }

    /// Activity ids in the order they were calculated
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, activity_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == activity_id).count()
    }
}

#[async_trait]
impl EmissionsCalculator for ScriptedCalculator {
    async fn calculate(&self, activity: &Activity) -> Result<f64, ClassifiedError> {
        self.calls.lock().unwrap().push(activity.id.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&activity.id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(class) => Err(ClassifiedError::new(
                class,
                format!("scripted {class} failure for {}", activity.id),
            )),
            None => Ok(activity.quantity),
        }
    }
}

/// Serve `router` on an ephemeral local port
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
