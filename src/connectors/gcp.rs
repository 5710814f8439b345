//! cloud-c connector (GCP)
//!
//! Reads the Carbon Footprint BigQuery export through the BigQuery REST API.
//! Authentication is a service-account key: an RS256-signed JWT assertion is
//! exchanged at the key's `token_uri` for a bearer token, which is cached and
//! refreshed like any other OAuth token.
//!
//! A query job is started once; its results are then read with offset paging
//! (`startIndex`/`maxResults`), polling while the job is still running.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::oauth::{AccessToken, TokenCache, TokenResponse};
use super::taxonomy;
use super::{
    metadata, new_activity_id, AuthRequest, ConnectorResult, IngestRequest, Provider,
    ProviderConnector,
};
use crate::config::{ConfigError, ConnectorLimits, GcpConfig};
use crate::ingestion::{
    ClassifiedError, ErrorClass, PaginationCursor, ProviderHttpClient, RateLimiter, RetryPolicy,
};
use crate::metrics::record_connector_records;
use crate::shutdown::ShutdownCoordinator;
use crate::{Activity, DataQuality, Unit};

/// OAuth scope requested for BigQuery access
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Grant type for JWT assertions
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_JOB_POLLS: u32 = 120;

/// Columns selected from the export, in row order
pub const EXPORT_COLUMNS: [&str; 16] = [
    "billing_account_id",
    "project_id",
    "project_name",
    "service_id",
    "service_description",
    "location",
    "country",
    "region",
    "usage_month",
    "carbon_footprint_kg_co2",
    "carbon_model_version",
    "scope_1_emissions_kg_co2",
    "scope_2_emissions_kg_co2",
    "scope_3_emissions_kg_co2",
    "electricity_consumption_kwh",
    "carbon_free_energy_score",
];

/// Fields of a service-account JSON key
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Always `service_account`
    #[serde(rename = "type", default)]
    pub key_type: String,
    /// Project the key belongs to
    #[serde(default)]
    pub project_id: String,
    /// Key id, sent as the JWT `kid`
    #[serde(default)]
    pub private_key_id: String,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// Service account identity
    pub client_email: String,
    /// Token endpoint
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse the JSON key text
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("gcp service account key: {e}")))?;
        if key.client_email.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "gcp service account key is missing client_email".to_string(),
            ));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    max_results: u32,
}

/// `jobs.query` / `jobs.getQueryResults` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryResponse {
    /// Job the results belong to
    pub job_reference: Option<JobReference>,
    /// False while the job is still running
    pub job_complete: bool,
    /// Rows in `f`/`v` cell form
    pub rows: Vec<TableRow>,
    /// Total row count, as a decimal string
    pub total_rows: Option<String>,
}

/// Identifies a query job
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobReference {
    /// Job id
    pub job_id: String,
    /// Processing location
    pub location: Option<String>,
}

/// One result row
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableRow {
    /// Cells in column order
    #[serde(default)]
    pub f: Vec<TableCell>,
}

/// One result cell
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableCell {
    /// Value; BigQuery encodes scalars as strings, NULL as null
    #[serde(default)]
    pub v: Value,
}

/// Decoded export row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarbonRecord {
    /// Billing account
    pub billing_account_id: String,
    /// Project id
    pub project_id: String,
    /// Project name
    pub project_name: String,
    /// Billing service id (`6F81-5844-456A`)
    pub service_id: String,
    /// Service description
    pub service_description: String,
    /// Location code (`us-central1`)
    pub location: String,
    /// Country code
    pub country: String,
    /// Region name
    pub region: String,
    /// `YYYYMM`
    pub usage_month: String,
    /// Total footprint, kg CO2e
    pub carbon_footprint_kg: f64,
    /// Model version
    pub carbon_model_version: String,
    /// Scope 1, kg CO2e
    pub scope1_kg: f64,
    /// Scope 2, kg CO2e
    pub scope2_kg: f64,
    /// Scope 3, kg CO2e
    pub scope3_kg: f64,
    /// Electricity used, kWh
    pub electricity_kwh: f64,
    /// Carbon-free energy score
    pub cfe_score: f64,
}

impl CarbonRecord {
    /// Decode a row; `None` when the row has too few cells
    pub fn from_row(row: &TableRow) -> Option<Self> {
        if row.f.len() < EXPORT_COLUMNS.len() - 1 {
            return None;
        }
        let text = |i: usize| -> String {
            match row.f.get(i).map(|cell| &cell.v) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        };
        let number = |i: usize| -> f64 { text(i).parse().unwrap_or(0.0) };

        Some(Self {
            billing_account_id: text(0),
            project_id: text(1),
            project_name: text(2),
            service_id: text(3),
            service_description: text(4),
            location: text(5),
            country: text(6),
            region: text(7),
            usage_month: text(8),
            carbon_footprint_kg: number(9),
            carbon_model_version: text(10),
            scope1_kg: number(11),
            scope2_kg: number(12),
            scope3_kg: number(13),
            electricity_kwh: number(14),
            cfe_score: number(15),
        })
    }

    /// Reported total, falling back to the scope sum
    pub fn emissions_kg(&self) -> f64 {
        if self.carbon_footprint_kg > 0.0 {
            self.carbon_footprint_kg
        } else {
            self.scope1_kg + self.scope2_kg + self.scope3_kg
        }
    }
}

/// The calendar month a `usage_month` value covers
pub fn usage_month_period(usage_month: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let value = usage_month.trim();
    let first = NaiveDate::parse_from_str(&format!("{value}01"), "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()?
        .with_day(1)?;
    let next = first.checked_add_months(Months::new(1))?;
    Some((
        first.and_hms_opt(0, 0, 0)?.and_utc(),
        next.and_hms_opt(0, 0, 0)?.and_utc(),
    ))
}

/// Exclusive `YYYYMM` bounds covering every month the window touches
fn month_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> (String, String) {
    let last = end - chrono::Duration::seconds(1);
    let after_last = NaiveDate::from_ymd_opt(last.year(), last.month(), 1)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .map(|d| d.format("%Y%m").to_string())
        .unwrap_or_else(|| end.format("%Y%m").to_string());
    (start.format("%Y%m").to_string(), after_last)
}

/// cloud-c connector
pub struct GcpConnector {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    token_uri: String,
    project_id: String,
    dataset: String,
    table: String,
    bigquery_endpoint: String,
    limits: ConnectorLimits,
    tokens: TokenCache,
    http: ProviderHttpClient,
}

impl GcpConnector {
    /// Build from configuration; the key is parsed and validated eagerly
    pub fn new(config: &GcpConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let key = ServiceAccountKey::from_json(&config.service_account_key()?)?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("gcp private key: {e}")))?;
        let token_uri = config
            .token_uri
            .clone()
            .or_else(|| key.token_uri.clone())
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        let project_id = if config.project_id.trim().is_empty() {
            key.project_id.clone()
        } else {
            config.project_id.clone()
        };

        let limits = config.limits();
        let limiter = Arc::new(RateLimiter::new(
            Provider::Gcp.as_str(),
            limits.rate_limit_capacity,
            limits.rate_limit_per_second,
        ));

        Ok(Self {
            key,
            signing_key,
            token_uri,
            project_id,
            dataset: config.dataset.clone(),
            table: config.table().to_string(),
            bigquery_endpoint: config.bigquery_endpoint(),
            limits,
            tokens: TokenCache::new(config.refresh_threshold()),
            http: ProviderHttpClient::new(Provider::Gcp.as_str(), limiter, retry, limits.timeout),
        })
    }

    /// Signed JWT assertion for the token exchange
    pub fn assertion(&self, now: DateTime<Utc>) -> ConnectorResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        if !self.key.private_key_id.is_empty() {
            header.kid = Some(self.key.private_key_id.clone());
        }
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.signing_key).map_err(|e| {
            ClassifiedError::with_source(ErrorClass::Auth, format!("sign JWT assertion: {e}"), e)
        })
    }

    async fn access_token(&self, cancel: &ShutdownCoordinator) -> ConnectorResult<String> {
        self.tokens
            .get_or_refresh(|| self.request_token(cancel))
            .await
            .map_err(|e| e.context("gcp token exchange"))
    }

    async fn request_token(&self, cancel: &ShutdownCoordinator) -> ConnectorResult<AccessToken> {
        let url = self.token_uri.as_str();
        let response: TokenResponse = self
            .http
            .send_json("token", cancel, || async move {
                let assertion = self.assertion(Utc::now())?;
                let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
                Ok(self.http.client().post(url).form(&form))
            })
            .await?;
        debug!(expires_in = response.expires_in, "Exchanged JWT assertion for access token");
        Ok(response.into_access_token())
    }

    /// Export query for the request window
    pub fn build_query(&self, request: &IngestRequest) -> String {
        let (start_month, end_month) = month_bounds(request.period_start, request.period_end);
        let mut query = format!(
            "SELECT billing_account_id, project.id AS project_id, project.name AS project_name, \
             service.id AS service_id, service.description AS service_description, \
             location.location AS location, location.country AS country, location.region AS region, \
             usage_month, carbon_footprint_kg_co2, carbon_model_version, \
             CAST(COALESCE(scope_1_emissions_kg_co2, 0) AS FLOAT64) AS scope_1_emissions_kg_co2, \
             CAST(COALESCE(scope_2_emissions_kg_co2, 0) AS FLOAT64) AS scope_2_emissions_kg_co2, \
             CAST(COALESCE(scope_3_emissions_kg_co2, 0) AS FLOAT64) AS scope_3_emissions_kg_co2, \
             CAST(COALESCE(electricity_consumption_kwh, 0) AS FLOAT64) AS electricity_consumption_kwh, \
             CAST(COALESCE(carbon_free_energy_score, 0) AS FLOAT64) AS carbon_free_energy_score \
             FROM `{}.{}.{}` \
             WHERE usage_month >= '{start_month}' AND usage_month < '{end_month}'",
            self.project_id, self.dataset, self.table
        );
        query.push_str(" ORDER BY usage_month, project_id, service_id");
        query
    }

    async fn start_query(
        &self,
        query: &str,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<JobReference> {
        let url = format!("{}/projects/{}/queries", self.bigquery_endpoint, self.project_id);
        let url = url.as_str();
        let body = QueryRequest {
            query,
            use_legacy_sql: false,
            max_results: 0,
        };
        let body = &body;

        let response: QueryResponse = self
            .http
            .send_json("bigquery_query", cancel, || async move {
                let token = self.access_token(cancel).await?;
                Ok(self.http.client().post(url).bearer_auth(token).json(body))
            })
            .await?;

        response
            .job_reference
            .filter(|job| !job.job_id.is_empty())
            .ok_or_else(|| ClassifiedError::bad_request("query response carried no job reference"))
    }

    async fn fetch_results(
        &self,
        job: &JobReference,
        start_index: u64,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<QueryResponse> {
        let mut url = format!(
            "{}/projects/{}/queries/{}?startIndex={start_index}&maxResults={}",
            self.bigquery_endpoint, self.project_id, job.job_id, self.limits.page_size
        );
        if let Some(location) = &job.location {
            url.push_str(&format!("&location={location}"));
        }
        let url = url.as_str();

        for poll in 0..MAX_JOB_POLLS {
            let response: QueryResponse = self
                .http
                .send_json("bigquery_results", cancel, || async move {
                    let token = self.access_token(cancel).await?;
                    Ok(self.http.client().get(url).bearer_auth(token))
                })
                .await?;
            if response.job_complete {
                return Ok(response);
            }

            debug!(job_id = %job.job_id, poll, "Query job still running");
            if !cancel.sleep(JOB_POLL_INTERVAL).await {
                return Err(ClassifiedError::transient("gcp query polling cancelled"));
            }
        }

        Err(ClassifiedError::transient(format!(
            "query job {} did not complete after {MAX_JOB_POLLS} polls",
            job.job_id
        )))
    }

    #[instrument(skip_all, fields(provider = "gcp", source = "bigquery"))]
    async fn fetch_footprint(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        let query = self.build_query(request);
        let job = self.start_query(&query, cancel).await?;
        info!(job_id = %job.job_id, "Query job started");

        let mut pages = PaginationCursor::offset(self.limits.page_size, self.limits.max_pages);
        let mut activities = Vec::new();

        while !pages.is_done() {
            pages.check_budget()?;
            let offset = pages.current_offset();
            let response = self.fetch_results(&job, offset, cancel).await?;

            let mut records = Vec::with_capacity(response.rows.len());
            for row in &response.rows {
                match CarbonRecord::from_row(row) {
                    Some(record) => records.push(record),
                    None => warn!(cells = row.f.len(), "Skipping malformed result row"),
                }
            }
            let converted = self.convert(&records, request);
            debug!(
                offset,
                rows = response.rows.len(),
                activities = converted.len(),
                "Result page processed"
            );
            activities.extend(converted);

            pages.record_page(response.rows.len(), None);
            let total: Option<u64> = response.total_rows.as_deref().and_then(|t| t.parse().ok());
            if let Some(total) = total {
                if offset + response.rows.len() as u64 >= total {
                    pages.mark_exhausted();
                }
            }
            if !pages.is_done() {
                pages.advance_page()?;
            }
        }

        if pages.hit_page_budget() {
            warn!(pagination = %pages, "Page budget reached before all result rows were read");
        }
        info!(total = activities.len(), pagination = %pages, "BigQuery ingestion complete");
        Ok(activities)
    }

    /// Convert export rows, skipping zero-emission rows and bad months
    pub fn convert(&self, records: &[CarbonRecord], request: &IngestRequest) -> Vec<Activity> {
        let now = Utc::now();
        let mut activities = Vec::with_capacity(records.len());

        for record in records {
            let emissions = record.emissions_kg();
            if emissions <= 0.0 {
                continue;
            }
            let Some((period_start, period_end)) = usage_month_period(&record.usage_month) else {
                warn!(usage_month = %record.usage_month, "Skipping row with unparsable usage month");
                continue;
            };

            activities.push(Activity {
                id: new_activity_id(),
                org_id: request.org_id.clone(),
                workspace_id: request.workspace_id.clone(),
                source: Provider::Gcp.source(),
                category: taxonomy::gcp_category(&record.service_id, &record.service_description),
                quantity: emissions,
                unit: Unit::KgCo2e,
                region: taxonomy::gcp_region(&record.location).to_string(),
                period_start,
                period_end,
                raw_metadata: metadata([
                    ("gcp_billing_account_id", record.billing_account_id.clone()),
                    ("gcp_project_id", record.project_id.clone()),
                    ("gcp_project_name", record.project_name.clone()),
                    ("gcp_service_id", record.service_id.clone()),
                    ("gcp_service_desc", record.service_description.clone()),
                    ("gcp_location", record.location.clone()),
                    ("gcp_country", record.country.clone()),
                    ("gcp_region", record.region.clone()),
                    ("carbon_model_version", record.carbon_model_version.clone()),
                    ("scope1_kg", format!("{:.2}", record.scope1_kg)),
                    ("scope2_kg", format!("{:.2}", record.scope2_kg)),
                    ("scope3_kg", format!("{:.2}", record.scope3_kg)),
                    ("electricity_kwh", format!("{:.2}", record.electricity_kwh)),
                    ("carbon_free_energy", format!("{:.1}%", record.cfe_score)),
                    ("data_source", "gcp_carbon_footprint".to_string()),
                ]),
                external_id: Some(format!(
                    "gcp_{}_{}_{}",
                    record.project_id, record.service_id, record.usage_month
                )),
                data_quality: DataQuality::Measured,
                created_at: now,
            });
        }
        activities
    }
}

#[async_trait]
impl ProviderConnector for GcpConnector {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        request.validate()?;
        info!(
            provider = "gcp",
            org_id = %request.org_id,
            project_id = %self.project_id,
            start = %request.period_start,
            end = %request.period_end,
            "Starting ingestion"
        );

        let activities = self
            .fetch_footprint(request, cancel)
            .await
            .map_err(|e| e.context("gcp carbon footprint export"))?;

        record_connector_records("gcp", activities.len());
        info!(provider = "gcp", total = activities.len(), "Ingestion complete");
        Ok(activities)
    }

    async fn get_auth_header(
        &self,
        _request: &AuthRequest<'_>,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<String> {
        let token = self.access_token(cancel).await?;
        Ok(format!("Bearer {token}"))
    }
}
