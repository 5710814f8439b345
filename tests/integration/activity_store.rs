//! Activity persistence on the batch database

use carbon_ingest::collaborators::{ActivityStore, SqliteActivityStore};
use carbon_ingest::{DataQuality, ErrorClass, Unit};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::support::{activity, temp_store};

#[tokio::test]
async fn test_round_trip_keeps_every_field() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());

    let mut original = activity("act-1", "org-1", 12.75);
    original.raw_metadata = BTreeMap::from([
        ("aws_service_code".to_string(), "AmazonEC2".to_string()),
        ("data_source".to_string(), "aws_carbon_footprint".to_string()),
    ]);
    original.external_id = Some("aws_1_AmazonEC2_us-east-1".to_string());
    original.data_quality = DataQuality::Estimated;
    activities.store(&original).await.unwrap();

    let loaded = activities.retrieve("act-1").await.unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.org_id, original.org_id);
    assert_eq!(loaded.source, original.source);
    assert_eq!(loaded.category, original.category);
    assert_eq!(loaded.unit, Unit::KgCo2e);
    assert!((loaded.quantity - 12.75).abs() < 1e-9);
    assert_eq!(loaded.period_start, original.period_start);
    assert_eq!(loaded.period_end, original.period_end);
    assert_eq!(loaded.raw_metadata, original.raw_metadata);
    assert_eq!(loaded.external_id, original.external_id);
    assert_eq!(loaded.data_quality, DataQuality::Estimated);
}

#[tokio::test]
async fn test_missing_activity_is_not_found() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());

    let err = activities.retrieve("nope").await.unwrap_err();
    assert_eq!(err.class, ErrorClass::NotFound);
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());

    activities.store(&activity("act-1", "org-1", 1.0)).await.unwrap();
    let err = activities
        .store(&activity("act-1", "org-1", 2.0))
        .await
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::BadRequest);
    let kept = activities.retrieve("act-1").await.unwrap();
    assert!((kept.quantity - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_store_many_is_all_or_nothing() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());
    activities.store(&activity("act-2", "org-1", 1.0)).await.unwrap();

    // act-2 collides halfway through the batch
    let batch = vec![
        activity("act-1", "org-1", 1.0),
        activity("act-2", "org-1", 1.0),
        activity("act-3", "org-1", 1.0),
    ];
    assert!(activities.store_many(&batch).await.is_err());

    assert_eq!(
        activities.retrieve("act-1").await.unwrap_err().class,
        ErrorClass::NotFound
    );
    assert_eq!(
        activities.retrieve("act-3").await.unwrap_err().class,
        ErrorClass::NotFound
    );
}

#[tokio::test]
async fn test_invalid_activity_rejected_before_insert() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());

    let mut inverted = activity("act-1", "org-1", 1.0);
    inverted.period_end = inverted.period_start - Duration::days(1);
    let err = activities.store(&inverted).await.unwrap_err();

    assert_eq!(err.class, ErrorClass::BadRequest);
    assert!(activities.retrieve("act-1").await.is_err());
}

#[tokio::test]
async fn test_search_by_org_orders_by_period_and_pages() {
    let (store, _dir) = temp_store().await;
    let activities = SqliteActivityStore::new(store.pool().clone());

    let mut records = Vec::new();
    for (id, month) in [("c", 3), ("a", 1), ("b", 2)] {
        let mut a = activity(id, "org-1", 1.0);
        a.period_start = Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap();
        a.period_end = a.period_start + Duration::days(28);
        records.push(a);
    }
    records.push(activity("other", "org-2", 1.0));
    activities.store_many(&records).await.unwrap();

    let ids = |page: Vec<carbon_ingest::Activity>| -> Vec<String> {
        page.into_iter().map(|a| a.id).collect()
    };
    assert_eq!(
        ids(activities.search_by_org("org-1", 10, 0).await.unwrap()),
        vec!["a", "b", "c"]
    );
    assert_eq!(
        ids(activities.search_by_org("org-1", 1, 1).await.unwrap()),
        vec!["b"]
    );
    assert!(activities
        .search_by_org("org-3", 10, 0)
        .await
        .unwrap()
        .is_empty());
}
