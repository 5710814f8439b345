//! cloud-b connector (Azure)
//!
//! Authenticates with OAuth2 client credentials and reads the Emissions
//! Impact Dashboard data API. Pages are chained through the absolute
//! `nextLink` URL returned with each page.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::oauth::{AccessToken, TokenCache, TokenResponse};
use super::taxonomy;
use super::{
    metadata, new_activity_id, parse_timestamp, AuthRequest, ConnectorResult, IngestRequest,
    Provider, ProviderConnector,
};
use crate::config::{AzureConfig, ConfigError, ConnectorLimits};
use crate::ingestion::{
    ClassifiedError, ErrorClass, PaginationCursor, ProviderHttpClient, RateLimiter, RetryPolicy,
};
use crate::metrics::record_connector_records;
use crate::shutdown::ShutdownCoordinator;
use crate::{Activity, DataQuality, Unit};

/// OAuth scope for the management API
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Emissions data API version
pub const EMISSIONS_API_VERSION: &str = "2021-09-09-preview";

/// One page of the emissions data API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionsPage {
    /// Records on this page
    #[serde(default)]
    pub value: Vec<EmissionRecord>,
    /// Absolute URL of the next page; absent on the last page
    #[serde(default)]
    pub next_link: Option<String>,
}

/// One emissions record; fields mirror the API payload
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmissionRecord {
    pub id: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub resource_type: String,
    pub resource_name: String,
    pub region: String,
    pub service_name: String,
    pub meter_category: String,
    pub meter_subcategory: String,
    /// Day the record covers
    pub date: String,
    #[serde(rename = "scope1CO2e")]
    pub scope1_co2e: f64,
    #[serde(rename = "scope2CO2e")]
    pub scope2_co2e: f64,
    #[serde(rename = "scope3CO2e")]
    pub scope3_co2e: f64,
    /// kg CO2e; zero when only the per-scope values are reported
    #[serde(rename = "totalCO2e")]
    pub total_co2e: f64,
    #[serde(rename = "energyConsumptionKWh")]
    pub energy_consumption_kwh: f64,
    /// gCO2e/kWh
    pub carbon_intensity: f64,
    pub renewable_energy_percent: f64,
}

impl EmissionRecord {
    /// Reported total, falling back to the scope sum
    pub fn emissions_kg(&self) -> f64 {
        if self.total_co2e > 0.0 {
            self.total_co2e
        } else {
            self.scope1_co2e + self.scope2_co2e + self.scope3_co2e
        }
    }
}

/// cloud-b connector
pub struct AzureConnector {
    client_id: String,
    client_secret: String,
    token_url: String,
    subscription_id: String,
    endpoint: String,
    limits: ConnectorLimits,
    tokens: TokenCache,
    http: ProviderHttpClient,
}

impl AzureConnector {
    /// Build from configuration with its own rate limiter and token cache
    pub fn new(config: &AzureConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let limits = config.limits();
        let limiter = Arc::new(RateLimiter::new(
            Provider::Azure.as_str(),
            limits.rate_limit_capacity,
            limits.rate_limit_per_second,
        ));
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret()?,
            token_url: config.token_url(),
            subscription_id: config.subscription_id.clone(),
            endpoint: config.endpoint(),
            limits,
            tokens: TokenCache::new(config.refresh_threshold()),
            http: ProviderHttpClient::new(
                Provider::Azure.as_str(),
                limiter,
                retry,
                limits.timeout,
            ),
        })
    }

    /// Current bearer token, refreshed through the rate-limited client
    async fn access_token(&self, cancel: &ShutdownCoordinator) -> ConnectorResult<String> {
        self.tokens
            .get_or_refresh(|| self.request_token(cancel))
            .await
            .map_err(|e| e.context("azure token refresh"))
    }

    async fn request_token(&self, cancel: &ShutdownCoordinator) -> ConnectorResult<AccessToken> {
        let url = self.token_url.as_str();
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let form = &form;

        let response: TokenResponse = self
            .http
            .send_json("token", cancel, || async move {
                Ok(self.http.client().post(url).form(form))
            })
            .await?;
        debug!(expires_in = response.expires_in, "Obtained access token");
        Ok(response.into_access_token())
    }

    /// First page URL for the request window
    pub fn emissions_url(&self, request: &IngestRequest) -> ConnectorResult<String> {
        let base = format!(
            "{}/subscriptions/{}/providers/Microsoft.Sustainability/emissionsData",
            self.endpoint, self.subscription_id
        );
        let mut url = Url::parse(&base).map_err(|e| {
            ClassifiedError::with_source(ErrorClass::BadRequest, format!("invalid URL {base}"), e)
        })?;
        url.query_pairs_mut()
            .append_pair("api-version", EMISSIONS_API_VERSION)
            .append_pair("$top", &self.limits.page_size.to_string())
            .append_pair(
                "$filter",
                &format!(
                    "date ge {} and date lt {}",
                    request.period_start.format("%Y-%m-%d"),
                    request.period_end.format("%Y-%m-%d")
                ),
            );
        Ok(url.into())
    }

    async fn fetch_page(
        &self,
        url: &str,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<EmissionsPage> {
        let attempt = || async move {
            self.http
                .send_json("emissions", cancel, || async move {
                    let token = self.access_token(cancel).await?;
                    Ok(self.http.client().get(url).bearer_auth(token))
                })
                .await
        };

        let result = attempt().await;
        let token_rejected = matches!(&result, Err(err) if err.class == ErrorClass::Auth);
        // a revoked or rotated token is refreshed once
        if token_rejected && self.tokens.is_cached().await {
            warn!("Access token rejected, refreshing");
            self.tokens.invalidate().await;
            return attempt().await;
        }
        result
    }

    #[instrument(skip_all, fields(provider = "azure", source = "emissions"))]
    async fn fetch_emissions(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        let first = self.emissions_url(request)?;
        let mut pages = PaginationCursor::cursor(self.limits.page_size, self.limits.max_pages);
        let mut activities = Vec::new();

        while !pages.is_done() {
            pages.check_budget()?;
            let url = pages.current_cursor().unwrap_or(first.as_str()).to_string();
            let page = self.fetch_page(&url, cancel).await?;

            let next = page.next_link.clone().filter(|link| !link.is_empty());
            let converted = self.convert(&page.value, request);
            debug!(
                records = page.value.len(),
                activities = converted.len(),
                has_next = next.is_some(),
                "Emissions page processed"
            );
            activities.extend(converted);

            // an empty page ends paging even if a link is present
            let next = if page.value.is_empty() { None } else { next };
            pages.record_page(page.value.len(), next);
            if !pages.is_done() {
                pages.advance_page()?;
            }
        }

        if pages.hit_page_budget() {
            warn!(pagination = %pages, "Page budget reached before provider signalled the end");
        }
        info!(total = activities.len(), pagination = %pages, "Emissions ingestion complete");
        Ok(activities)
    }

    /// Convert emissions records, skipping zero-emission rows
    pub fn convert(&self, records: &[EmissionRecord], request: &IngestRequest) -> Vec<Activity> {
        let now = Utc::now();
        let mut activities = Vec::with_capacity(records.len());

        for record in records {
            let emissions = record.emissions_kg();
            if emissions <= 0.0 {
                continue;
            }
            let Some(day) = parse_timestamp(&record.date) else {
                warn!(id = %record.id, date = %record.date, "Skipping record with unparsable date");
                continue;
            };

            activities.push(Activity {
                id: new_activity_id(),
                org_id: request.org_id.clone(),
                workspace_id: request.workspace_id.clone(),
                source: Provider::Azure.source(),
                category: taxonomy::azure_category(&record.service_name, &record.resource_type),
                quantity: emissions,
                unit: Unit::KgCo2e,
                region: taxonomy::azure_region(&record.region).to_string(),
                period_start: day,
                period_end: day + ChronoDuration::days(1),
                raw_metadata: metadata([
                    ("azure_subscription_id", record.subscription_id.clone()),
                    ("azure_resource_group", record.resource_group.clone()),
                    ("azure_service", record.service_name.clone()),
                    ("azure_meter_category", record.meter_category.clone()),
                    ("azure_meter_subcategory", record.meter_subcategory.clone()),
                    ("azure_resource_type", record.resource_type.clone()),
                    ("azure_resource_name", record.resource_name.clone()),
                    ("azure_region", record.region.clone()),
                    ("energy_kwh", format!("{:.2}", record.energy_consumption_kwh)),
                    ("carbon_intensity", format!("{:.2} gCO2e/kWh", record.carbon_intensity)),
                    ("renewable_percent", format!("{:.1}%", record.renewable_energy_percent)),
                    ("data_source", "azure_emissions_api".to_string()),
                ]),
                external_id: Some(record.id.clone()).filter(|id| !id.is_empty()),
                data_quality: DataQuality::Measured,
                created_at: now,
            });
        }
        activities
    }
}

#[async_trait]
impl ProviderConnector for AzureConnector {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>> {
        request.validate()?;
        info!(
            provider = "azure",
            org_id = %request.org_id,
            subscription_id = %self.subscription_id,
            start = %request.period_start,
            end = %request.period_end,
            "Starting ingestion"
        );

        let activities = self
            .fetch_emissions(request, cancel)
            .await
            .map_err(|e| e.context("azure emissions"))?;

        record_connector_records("azure", activities.len());
        info!(provider = "azure", total = activities.len(), "Ingestion complete");
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
