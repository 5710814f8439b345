//! Collaborator seams used by the batch scheduler and the pipeline.
//!
//! Both traits report failures as [`ClassifiedError`] so the scheduler can
//! decide between retrying and failing an activity without knowing which
//! implementation is plugged in.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::ingestion::{ClassifiedError, ErrorClass, ErrorClassifier};
use crate::{Activity, Unit};

/// Turns an activity into kg CO2e
#[async_trait]
pub trait EmissionsCalculator: Send + Sync {
    /// Emissions of `activity` in kg CO2e
    async fn calculate(&self, activity: &Activity) -> Result<f64, ClassifiedError>;
}

/// Durable home of canonical activities
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persist one activity; ids are unique and records immutable
    async fn store(&self, activity: &Activity) -> Result<(), ClassifiedError>;

    /// Persist many activities atomically
    async fn store_many(&self, activities: &[Activity]) -> Result<(), ClassifiedError>;

    /// Activity by id; a missing id is a `NotFound` error
    async fn retrieve(&self, id: &str) -> Result<Activity, ClassifiedError>;

    /// Activities of an organization ordered by period start
    async fn search_by_org(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Activity>, ClassifiedError>;
}

/// Calculator for activities that already carry emissions.
///
/// Provider carbon reports arrive in kg or tonnes of CO2e; anything else
/// needs an emissions factor this crate does not have and is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedEmissionsCalculator;

#[async_trait]
impl EmissionsCalculator for ReportedEmissionsCalculator {
    async fn calculate(&self, activity: &Activity) -> Result<f64, ClassifiedError> {
        match activity.unit {
            Unit::KgCo2e => Ok(activity.quantity),
            Unit::TonneCo2e => Ok(activity.quantity * 1000.0),
            unit => Err(ClassifiedError::bad_request(format!(
                "no emissions factor for {} activity {} in {unit}",
                activity.category, activity.id
            ))),
        }
    }
}

/// Activity store on the batch database
#[derive(Debug, Clone)]
pub struct SqliteActivityStore {
    pool: SqlitePool,
}

impl SqliteActivityStore {
    /// Use `pool`; the `activities` table comes from the batch migrations
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(
        conn: &mut sqlx::SqliteConnection,
        activity: &Activity,
    ) -> Result<(), ClassifiedError> {
        let metadata = serde_json::to_string(&activity.raw_metadata).map_err(|e| {
            ClassifiedError::with_source(ErrorClass::BadRequest, "metadata encoding", e)
        })?;

        sqlx::query(
            "INSERT INTO activities (id, org_id, workspace_id, source, category, quantity, unit, \
             region, period_start, period_end, raw_metadata, external_id, data_quality, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&activity.id)
        .bind(&activity.org_id)
        .bind(&activity.workspace_id)
        .bind(activity.source.as_str())
        .bind(activity.category.as_str())
        .bind(activity.quantity)
        .bind(activity.unit.as_str())
        .bind(&activity.region)
        .bind(timestamp(activity.period_start))
        .bind(timestamp(activity.period_end))
        .bind(metadata)
        .bind(activity.external_id.as_deref())
        .bind(activity.data_quality.as_str())
        .bind(timestamp(activity.created_at))
        .execute(conn)
        .await
        .map_err(|e| db_error(e, &activity.id))?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    #[instrument(skip_all, fields(activity_id = %activity.id))]
    async fn store(&self, activity: &Activity) -> Result<(), ClassifiedError> {
        validate(activity)?;
        let mut conn = self.pool.acquire().await.map_err(|e| db_error(e, "acquire"))?;
        Self::insert(&mut *conn, activity).await
    }

    #[instrument(skip_all, fields(count = activities.len()))]
    async fn store_many(&self, activities: &[Activity]) -> Result<(), ClassifiedError> {
        for activity in activities {
            validate(activity)?;
        }
        let mut tx = self.pool.begin().await.map_err(|e| db_error(e, "begin"))?;
        for activity in activities {
            Self::insert(&mut *tx, activity).await?;
        }
        tx.commit().await.map_err(|e| db_error(e, "commit"))?;
        debug!(count = activities.len(), "Stored activities");
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Activity, ClassifiedError> {
        let row = sqlx::query("SELECT * FROM activities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(e, id))?;
        match row {
            Some(row) => activity_from_row(&row),
            None => Err(ClassifiedError::new(
                ErrorClass::NotFound,
                format!("activity {id} not found"),
            )),
        }
    }

    async fn search_by_org(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Activity>, ClassifiedError> {
        let rows = sqlx::query(
            "SELECT * FROM activities WHERE org_id = ? \
             ORDER BY period_start ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(org_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error(e, org_id))?;
        rows.iter().map(activity_from_row).collect()
    }
}

/// Process-local activity store, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryActivityStore {
    activities: RwLock<HashMap<String, Activity>>,
}

impl MemoryActivityStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored activities
    pub async fn len(&self) -> usize {
        self.activities.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.activities.read().await.is_empty()
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn store(&self, activity: &Activity) -> Result<(), ClassifiedError> {
        self.store_many(std::slice::from_ref(activity)).await
    }

    async fn store_many(&self, activities: &[Activity]) -> Result<(), ClassifiedError> {
        let mut map = self.activities.write().await;
        let mut batch_ids = HashSet::with_capacity(activities.len());
        for activity in activities {
            validate(activity)?;
            if map.contains_key(&activity.id) || !batch_ids.insert(activity.id.as_str()) {
                return Err(already_stored(&activity.id));
            }
        }
        for activity in activities {
            map.insert(activity.id.clone(), activity.clone());
        }
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Activity, ClassifiedError> {
        self.activities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ClassifiedError::new(ErrorClass::NotFound, format!("activity {id} not found")))
    }

    async fn search_by_org(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Activity>, ClassifiedError> {
        let map = self.activities.read().await;
        let mut matches: Vec<_> = map.values().filter(|a| a.org_id == org_id).cloned().collect();
        matches.sort_by(|a, b| {
            a.period_start
                .cmp(&b.period_start)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

fn validate(activity: &Activity) -> Result<(), ClassifiedError> {
    activity
        .validate()
        .map_err(|e| ClassifiedError::with_source(ErrorClass::BadRequest, format!("activity {}", activity.id), e))
}

fn already_stored(id: &str) -> ClassifiedError {
    ClassifiedError::bad_request(format!("activity {id} is already stored"))
}

fn db_error(err: sqlx::Error, context: &str) -> ClassifiedError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return already_stored(context);
        }
    }
    let class = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorClass::Transient,
        other => ErrorClassifier::classify_message(&other.to_string()),
    };
    // SQLite reports contention as "database is locked"
    let class = if err.to_string().contains("database is locked") {
        ErrorClass::Transient
    } else {
        class
    };
    let message = format!("activity store ({context}): {err}");
    ClassifiedError::with_source(class, message, err)
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn activity_from_row(row: &SqliteRow) -> Result<Activity, ClassifiedError> {
    let decode = |e: sqlx::Error| ClassifiedError::with_source(ErrorClass::Fatal, "activity row", e);
    let text = |col: &str| row.try_get::<String, _>(col).map_err(decode);
    let parse_ts = |col: &str| -> Result<DateTime<Utc>, ClassifiedError> {
        let raw = text(col)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| ClassifiedError::with_source(ErrorClass::Fatal, format!("{col}: {raw}"), e))
    };
    let enum_field = |col: &str, err: String| ClassifiedError::fatal(format!("{col}: {err}"));

    let metadata: BTreeMap<String, String> = serde_json::from_str(&text("raw_metadata")?)
        .map_err(|e| ClassifiedError::with_source(ErrorClass::Fatal, "raw_metadata", e))?;

    Ok(Activity {
        id: text("id")?,
        org_id: text("org_id")?,
        workspace_id: text("workspace_id")?,
        source: FromStr::from_str(&text("source")?).map_err(|e| enum_field("source", e))?,
        category: FromStr::from_str(&text("category")?).map_err(|e| enum_field("category", e))?,
        quantity: row.try_get("quantity").map_err(decode)?,
        unit: FromStr::from_str(&text("unit")?).map_err(|e| enum_field("unit", e))?,
        region: text("region")?,
        period_start: parse_ts("period_start")?,
        period_end: parse_ts("period_end")?,
        raw_metadata: metadata,
        external_id: row.try_get("external_id").map_err(decode)?,
        data_quality: FromStr::from_str(&text("data_quality")?)
            .map_err(|e| enum_field("data_quality", e))?,
        created_at: parse_ts("created_at")?,
    })
}
