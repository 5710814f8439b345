//! cloud-a connector (AWS)
//!
//! Two data sources:
//! - Carbon footprint summary (JSON, cursor paging on `NextToken`), emissions
//!   reported in metric tonnes and converted to kgCO2e
//! - Optional Cost and Usage Report: `manifest.json` lists CSV report files,
//!   which are paged by offset, one file per page
//!
//! Every request is signed with SigV4 at send time, so retries carry a fresh
//! timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::sigv4::{self, SigV4Credentials, AMZ_DATE_HEADER};
use super::taxonomy;
use super::{
    metadata, new_activity_id, parse_timestamp, AuthRequest, ConnectorResult, IngestRequest,
    Provider, ProviderConnector,
};
use crate::config::{AwsConfig, ConfigError, ConnectorLimits, CurConfig};
use crate::ingestion::http::parse_json;
use crate::ingestion::{ClassifiedError, PaginationCursor, ProviderHttpClient, RateLimiter, RetryPolicy};
use crate::metrics::record_connector_records;
use crate::shutdown::ShutdownCoordinator;
use crate::{Activity, DataQuality, Unit};

/// `X-Amz-Target` of the carbon footprint summary operation
pub const CARBON_TARGET: &str = "AWSInsightsIndexService.GetCarbonFootprintSummary";

const CARBON_SERVICE: &str = "ce";
const S3_SERVICE: &str = "s3";
const KG_PER_TONNE: f64 = 1000.0;

/// Carbon footprint request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CarbonFootprintRequest<'a> {
    time_period: TimePeriod,
    granularity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TimePeriod {
    start: String,
    end: String,
}

/// Carbon footprint summary response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarbonFootprintSummary {
    /// Emissions broken down by service and region
    #[serde(default)]
    pub emissions_by_service: Vec<ServiceEmission>,
    /// Sum over the period, metric tonnes
    #[serde(default, rename = "totalCO2e")]
    pub total_co2e: f64,
    /// Unit label as reported
    #[serde(default)]
    pub unit: String,
    /// Covered period
    #[serde(default)]
    pub period: Option<ReportPeriod>,
    /// Continuation token
    #[serde(default, alias = "NextToken")]
    pub next_token: Option<String>,
}

/// Emissions for one service in one region
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEmission {
    /// Service code (`AmazonEC2`)
    #[serde(default)]
    pub service_code: String,
    /// Display name
    #[serde(default)]
    pub service_name: String,
    /// Metric tonnes CO2e
    #[serde(default, rename = "co2e")]
    pub co2e: f64,
    /// AWS region code
    #[serde(default)]
    pub region: String,
    /// `Scope1`, `Scope2` or `Scope3`
    #[serde(default)]
    pub scope: String,
}

/// Period in a carbon response or CUR manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ReportPeriod {
    /// Start timestamp text
    pub start: String,
    /// End timestamp text
    pub end: String,
}

/// CUR `manifest.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurManifest {
    /// Report assembly
    #[serde(default)]
    pub assembly_id: String,
    /// Billing period covered
    pub billing_period: ReportPeriod,
    /// Every object written for this report version
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

/// One object listed in a CUR manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Object key
    pub key: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
}

impl CurManifest {
    /// Report data files, CSV preferred
    pub fn report_files(&self) -> Vec<&ManifestFile> {
        let data: Vec<&ManifestFile> = self
            .files
            .iter()
            .filter(|f| !f.key.ends_with("manifest.json") && !f.key.ends_with(".json"))
            .collect();
        let csv: Vec<&ManifestFile> = data
            .iter()
            .copied()
            .filter(|f| f.key.ends_with(".csv"))
            .collect();
        if csv.is_empty() {
            data
        } else {
            csv
        }
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let total: u64 = self.files.iter().map(|f| f.size).sum();
        format!(
            "assembly={} period={}..{} files={} bytes={}",
            self.assembly_id,
            self.billing_period.start,
            self.billing_period.end,
            self.report_files().len(),
            total
        )
    }
}

/// cloud-a connector
pub struct AwsConnector {
    credentials: SigV4Credentials,
    session_token: Option<String>,
    account_id: String,
    endpoint: String,
    cur: Option<CurConfig>,
    limits: ConnectorLimits,
    http: ProviderHttpClient,
}

impl AwsConnector {
    /// Build from configuration with its own rate limiter
    pub fn new(config: &AwsConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let limits = config.limits();
        let limiter = Arc::new(RateLimiter::new(
            Provider::Aws.as_str(),
            limits.rate_limit_capacity,
            limits.rate_limit_per_second,
        ));
        Ok(Self {
            credentials: SigV4Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key()?,
                region: config.region().to_string(),
            },
            session_token: config.session_token.clone(),
            account_id: config.account_id.clone().unwrap_or_default(),
            endpoint: config.endpoint().trim_end_matches('/').to_string(),
            cur: config.cur.clone(),
            limits,
            http: ProviderHttpClient::new(Provider::Aws.as_str(), limiter, retry, limits.timeout),
        })
    }

    /// Build a signed request; called once per attempt
    fn signed_request(
        &self,
        method: Method,
        url: &str,
        service: &str,
        extra_headers: &[(&'static str, String)],
        body: &[u8],
    ) -> ConnectorResult<RequestBuilder> {
        let mut headers: Vec<(&'static str, String)> = extra_headers.to_vec();
        headers.push((AMZ_DATE_HEADER, sigv4::amz_date(Utc::now())));
        if service == S3_SERVICE {
            headers.push(("x-amz-content-sha256", sigv4::payload_hash(body)));
        }
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }

        let authorization = sigv4::authorization_header(
            &self.credentials,
            &AuthRequest {
                method: method.as_str(),
                url,
                headers: &headers,
                body,
                service: Some(service),
            },
        )?;

        let mut builder = self.http.client().request(method, url);
        for (name, value) in &headers {
            builder = builder.header(*name, value.as_str());
        }
        Ok(builder
            .header(AUTHORIZATION, authorization)
            .body(body.to_vec()))
    }

    #[instrument(skip_all, fields(provider = "aws", source = "carbon_footprint"))]
    async fn fetch_carbon(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        let url = format!("{}/", self.endpoint);
        let url = url.as_str();
        let mut pages = PaginationCursor::cursor(self.limits.page_size, self.limits.max_pages);
        let mut activities = Vec::new();

        while !pages.is_done() {
            pages.check_budget()?;
            let body = serde_json::to_vec(&CarbonFootprintRequest {
                time_period: TimePeriod {
                    start: request.period_start.format("%Y-%m-%d").to_string(),
                    end: request.period_end.format("%Y-%m-%d").to_string(),
                },
                granularity: "MONTHLY",
                next_token: pages.current_cursor(),
            })
            .map_err(|e| ClassifiedError::bad_request(format!("encode carbon request: {e}")))?;
            let body = body.as_slice();
            let headers = [
                ("x-amz-target", CARBON_TARGET.to_string()),
                ("content-type", "application/x-amz-json-1.1".to_string()),
            ];
            let headers = &headers;

            let summary: CarbonFootprintSummary = self
                .http
                .send_json("carbon_footprint", cancel, || async move {
                    self.signed_request(Method::POST, url, CARBON_SERVICE, headers, body)
                })
                .await?;

            let converted = self.convert_carbon(&summary, request);
            debug!(
                records = summary.emissions_by_service.len(),
                activities = converted.len(),
                has_next = summary.next_token.is_some(),
                "Carbon footprint page processed"
            );
            pages.record_page(summary.emissions_by_service.len(), summary.next_token.clone());
            activities.extend(converted);
            if !pages.is_done() {
                pages.advance_page()?;
            }
        }

        if pages.hit_page_budget() {
            warn!(pagination = %pages, "Page budget reached before provider signalled the end");
        }
        info!(total = activities.len(), pagination = %pages, "Carbon footprint ingestion complete");
        Ok(activities)
    }

    /// Convert one carbon summary page
    pub fn convert_carbon(
        &self,
        summary: &CarbonFootprintSummary,
        request: &IngestRequest,
    ) -> Vec<Activity> {
        let (period_start, period_end) = summary
            .period
            .as_ref()
            .and_then(|p| Some((parse_timestamp(&p.start)?, parse_timestamp(&p.end)?)))
            .filter(|(start, end)| start < end)
            .unwrap_or((request.period_start, request.period_end));
        let now = Utc::now();

        summary
            .emissions_by_service
            .iter()
            .filter(|e| e.co2e > 0.0)
            .map(|emission| Activity {
                id: new_activity_id(),
                org_id: request.org_id.clone(),
                workspace_id: request.workspace_id.clone(),
                source: Provider::Aws.source(),
                category: taxonomy::aws_category(&emission.service_code),
                quantity: emission.co2e * KG_PER_TONNE,
                unit: Unit::KgCo2e,
                region: taxonomy::aws_region(&emission.region).to_string(),
                period_start,
                period_end,
                raw_metadata: metadata([
                    ("aws_service_code", emission.service_code.clone()),
                    ("aws_service_name", emission.service_name.clone()),
                    ("aws_region", emission.region.clone()),
                    ("emission_scope", normalize_scope(&emission.scope).to_string()),
                    ("reported_unit", summary.unit.clone()),
                    ("data_source", "aws_carbon_footprint".to_string()),
                ]),
                external_id: Some(format!(
                    "aws_{}_{}_{}",
                    self.account_id, emission.service_code, emission.region
                )),
                data_quality: DataQuality::Measured,
                created_at: now,
            })
            .collect()
    }

    #[instrument(skip_all, fields(provider = "aws", source = "cur"))]
    async fn fetch_cur(
        &self,
        cur: &CurConfig,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        let base = cur.bucket_url(&self.credentials.region);
        let base = base.trim_end_matches('/');
        let prefix = cur.prefix.trim_matches('/');
        let manifest_url = if prefix.is_empty() {
            format!("{base}/manifest.json")
        } else {
            format!("{base}/{prefix}/manifest.json")
        };
        let manifest_url = manifest_url.as_str();

        let manifest: CurManifest = self
            .http
            .send_json("cur_manifest", cancel, || async move {
                self.signed_request(Method::GET, manifest_url, S3_SERVICE, &[], &[])
            })
            .await?;
        info!(manifest = %manifest.summary(), "CUR manifest loaded");

        let files = manifest.report_files();
        let mut pages = PaginationCursor::offset(1, self.limits.max_pages);
        let mut activities = Vec::new();

        while !pages.is_done() {
            let index = pages.current_offset() as usize;
            let Some(file) = files.get(index) else {
                pages.mark_exhausted();
                break;
            };
            pages.check_budget()?;

            if !file.key.ends_with(".csv") {
                warn!(key = %file.key, "Skipping compressed or non-CSV report file");
                pages.record_page(1, None);
                pages.advance_page()?;
                continue;
            }

            let file_url = format!("{base}/{}", file.key.trim_start_matches('/'));
            let file_url = file_url.as_str();
            let csv_body = self
                .http
                .send("cur_report", cancel, || async move {
                    self.signed_request(Method::GET, file_url, S3_SERVICE, &[], &[])
                })
                .await?;

            let rows = parse_cur_csv(&csv_body)?;
            let converted = self.convert_cur(&rows, request);
            debug!(key = %file.key, rows = rows.len(), activities = converted.len(), "CUR file processed");
            activities.extend(converted);

            pages.record_page(1, None);
            pages.advance_page()?;
        }

        if pages.hit_page_budget() {
            warn!(pagination = %pages, "Page budget reached before all CUR files were read");
        }
        info!(total = activities.len(), pagination = %pages, "CUR ingestion complete");
        Ok(activities)
    }

    /// Convert CUR rows that fall inside the request window
    pub fn convert_cur(&self, rows: &[CurRecord], request: &IngestRequest) -> Vec<Activity> {
        let now = Utc::now();
        let mut activities = Vec::with_capacity(rows.len());

        for row in rows {
            let (Some(start), Some(end)) = (
                parse_timestamp(&row.usage_start_date),
                parse_timestamp(&row.usage_end_date),
            ) else {
                warn!(line_item = %row.line_item_id, "Skipping CUR row with unparsable usage dates");
                continue;
            };
            if start >= end || !in_window(start, request.period_start, request.period_end) {
                continue;
            }

            let category = taxonomy::aws_category(&row.service_code);
            let unit = match taxonomy::aws_unit(&row.usage_unit) {
                Some(unit) if category.allows_unit(unit) => unit,
                _ => Unit::Other,
            };

            activities.push(Activity {
                id: new_activity_id(),
                org_id: request.org_id.clone(),
                workspace_id: request.workspace_id.clone(),
                source: Provider::Aws.source(),
                category,
                quantity: row.usage_amount.max(0.0),
                unit,
                region: taxonomy::aws_region(&row.region).to_string(),
                period_start: start,
                period_end: end,
                raw_metadata: metadata([
                    ("aws_service_code", row.service_code.clone()),
                    ("aws_service_name", row.product_name.clone()),
                    ("aws_usage_type", row.usage_type.clone()),
                    ("aws_usage_unit", row.usage_unit.clone()),
                    ("aws_instance_type", row.instance_type.clone()),
                    ("aws_cost_usd", format!("{:.4}", row.blended_cost)),
                    ("data_source", "aws_cur".to_string()),
                ]),
                external_id: Some(row.line_item_id.clone()).filter(|id| !id.is_empty()),
                data_quality: DataQuality::Measured,
                created_at: now,
            });
        }
        activities
    }
}

#[async_trait]
impl ProviderConnector for AwsConnector {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        request.validate()?;
        info!(
            provider = "aws",
            org_id = %request.org_id,
            start = %request.period_start,
            end = %request.period_end,
            "Starting ingestion"
        );

        let mut activities = self
            .fetch_carbon(request, cancel)
            .await
            .map_err(|e| e.context("aws carbon footprint"))?;

        if let Some(cur) = &self.cur {
            let rows = self
                .fetch_cur(cur, request, cancel)
                .await
                .map_err(|e| e.context("aws cost and usage report"))?;
            activities.extend(rows);
        }

        record_connector_records("aws", activities.len());
        info!(provider = "aws", total = activities.len(), "Ingestion complete");
        Ok(activities)
    }

    async fn get_auth_header(
        &self,
        request: &AuthRequest<'_>,
        _cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<String> {
        let request = AuthRequest {
            service: request.service.or(Some(CARBON_SERVICE)),
            ..*request
        };
        sigv4::authorization_header(&self.credentials, &request)
    }
}

/// One CUR line item, columns resolved by header name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurRecord {
    /// `lineItem/Id`
    pub line_item_id: String,
    /// `product/servicecode`
    pub service_code: String,
    /// `product/productname`
    pub product_name: String,
    /// `product/region`
    pub region: String,
    /// `lineItem/UsageAmount`
    pub usage_amount: f64,
    /// `lineItem/UsageUnit`
    pub usage_unit: String,
    /// `lineItem/UsageType`
    pub usage_type: String,
    /// `lineItem/UsageStartDate`
    pub usage_start_date: String,
    /// `lineItem/UsageEndDate`
    pub usage_end_date: String,
    /// `lineItem/BlendedCost`
    pub blended_cost: f64,
    /// `lineItem/UnblendedCost`
    pub unblended_cost: f64,
    /// `product/instanceType`
    pub instance_type: String,
}

/// Parse a CUR CSV file; columns are matched case-insensitively by name
pub fn parse_cur_csv(body: &str) -> ConnectorResult<Vec<CurRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(body.as_bytes());

    let columns: HashMap<String, usize> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();
    if !columns.contains_key("lineitem/usageamount") {
        return Err(ClassifiedError::bad_request(
            "CUR file is missing the lineItem/UsageAmount column",
        ));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        let text = |column: &str| -> String {
            columns
                .get(column)
                .and_then(|&i| row.get(i))
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let number = |column: &str| -> f64 { text(column).parse().unwrap_or(0.0) };

        records.push(CurRecord {
            line_item_id: text("lineitem/id"),
            service_code: text("product/servicecode"),
            product_name: text("product/productname"),
            region: text("product/region"),
            usage_amount: number("lineitem/usageamount"),
            usage_unit: text("lineitem/usageunit"),
            usage_type: text("lineitem/usagetype"),
            usage_start_date: text("lineitem/usagestartdate"),
            usage_end_date: text("lineitem/usageenddate"),
            blended_cost: number("lineitem/blendedcost"),
            unblended_cost: number("lineitem/unblendedcost"),
            instance_type: text("product/instancetype"),
        });
    }
    Ok(records)
}

fn csv_error(err: csv::Error) -> ClassifiedError {
    ClassifiedError::with_source(
        crate::ingestion::ErrorClass::BadRequest,
        format!("malformed CUR file: {err}"),
        err,
    )
}

fn normalize_scope(scope: &str) -> &'static str {
    match scope.to_lowercase().as_str() {
        "scope1" => "scope1",
        "scope2" => "scope2",
        // cloud usage is scope 3 for customers unless stated otherwise
        _ => "scope3",
    }
}

/// Parse a carbon footprint response body (exposed for fixtures)
pub fn parse_carbon_summary(body: &str) -> ConnectorResult<CarbonFootprintSummary> {
    parse_json(body, "carbon_footprint")
}

/// Whether a timestamp lies in `[start, end)`
fn in_window(ts: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    ts >= start && ts < end
}
