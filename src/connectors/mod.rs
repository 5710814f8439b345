//! Provider connectors
//!
//! Each connector turns one provider's usage and carbon APIs into canonical
//! [`Activity`] records. They share the same shape: authenticate, page through
//! every data source with a rate-limited retrying client, convert records via
//! the [`taxonomy`] tables. Ingestion is all-or-nothing: any non-retryable
//! failure discards the partial result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{ConfigError, ConnectorsConfig};
use crate::ingestion::{ClassifiedError, RetryPolicy};
use crate::shutdown::ShutdownCoordinator;
use crate::{Activity, ActivitySource};

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod oauth;
pub mod sigv4;
pub mod taxonomy;

pub use aws::AwsConnector;
pub use azure::AzureConnector;
pub use gcp::GcpConnector;

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ClassifiedError>;

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    /// cloud-a
    Aws,
    /// cloud-b
    Azure,
    /// cloud-c
    Gcp,
}

impl Provider {
    /// All providers in a stable order
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Gcp];

    /// Lowercase label used in CLI arguments, logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }

    /// Activity source recorded on converted records
    pub fn source(&self) -> ActivitySource {
        match self {
            Provider::Aws => ActivitySource::CloudA,
            Provider::Azure => ActivitySource::CloudB,
            Provider::Gcp => ActivitySource::CloudC,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" | "cloud-a" => Ok(Provider::Aws),
            "azure" | "cloud-b" => Ok(Provider::Azure),
            "gcp" | "cloud-c" => Ok(Provider::Gcp),
            _ => Err(format!("Invalid provider: {s} (expected aws, azure or gcp)")),
        }
    }
}

/// What to ingest and on whose behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    /// Organization the activities belong to
    pub org_id: String,
    /// Workspace the activities belong to
    pub workspace_id: String,
    /// Inclusive start of the usage window
    pub period_start: DateTime<Utc>,
    /// Exclusive end of the usage window
    pub period_end: DateTime<Utc>,
}

impl IngestRequest {
    /// Create a request
    pub fn new(
        org_id: impl Into<String>,
        workspace_id: impl Into<String>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            workspace_id: workspace_id.into(),
            period_start,
            period_end,
        }
    }

    /// Reject empty tenants and empty or inverted windows
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.org_id.trim().is_empty() || self.workspace_id.trim().is_empty() {
            return Err(ClassifiedError::bad_request(
                "org_id and workspace_id are required",
            ));
        }
        if self.period_start >= self.period_end {
            return Err(ClassifiedError::bad_request(format!(
                "period start {} must be before end {}",
                self.period_start, self.period_end
            )));
        }
        Ok(())
    }
}

/// The parts of an outgoing request an auth scheme may need.
///
/// Bearer-token providers ignore everything; request-signing providers sign
/// method, URL, headers and body.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Absolute URL including query
    pub url: &'a str,
    /// Headers that will be sent and must be covered by a signature
    pub headers: &'a [(&'a str, String)],
    /// Request body
    pub body: &'a [u8],
    /// Provider service the request targets, for signing schemes that scope by it
    pub service: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    /// Request with no headers or body
    pub fn new(method: &'a str, url: &'a str) -> Self {
        Self {
            method,
            url,
            headers: &[],
            body: &[],
            service: None,
        }
    }
}

/// A provider connector
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Which provider this connector talks to
    fn provider(&self) -> Provider;

    /// Fetch every activity in the request window.
    ///
    /// Returns all activities or a classified error; partial results are never
    /// returned.
    async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<Vec<Activity>>;

    /// Produce the `Authorization` header value for `request`
    async fn get_auth_header(
        &self,
        request: &AuthRequest<'_>,
        cancel: &ShutdownCoordinator,
    ) -> ConnectorResult<String>;
}

/// The configured connectors, one per provider
#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: HashMap<Provider, Arc<dyn ProviderConnector>>,
}

impl ConnectorSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one connector per configured provider.
    ///
    /// Each gets its own rate limiter and HTTP client.
    pub fn from_config(
        config: &ConnectorsConfig,
        retry: &RetryPolicy,
    ) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        if let Some(aws) = &config.aws {
            set.insert(Arc::new(AwsConnector::new(aws, retry.clone())?));
        }
        if let Some(azure) = &config.azure {
            set.insert(Arc::new(AzureConnector::new(azure, retry.clone())?));
        }
        if let Some(gcp) = &config.gcp {
            set.insert(Arc::new(GcpConnector::new(gcp, retry.clone())?));
        }
        Ok(set)
    }

    /// Add or replace the connector for its provider
    pub fn insert(&mut self, connector: Arc<dyn ProviderConnector>) {
        self.connectors.insert(connector.provider(), connector);
    }

    /// Connector for `provider`
    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderConnector>> {
        self.connectors.get(&provider).cloned()
    }

    /// Configured providers, sorted
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.connectors.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Whether no connector is configured
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorSet")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Build the raw metadata map for an activity from provider fields
pub(crate) fn metadata<const N: usize>(
    pairs: [(&str, String); N],
) -> std::collections::BTreeMap<String, String> {
    pairs
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Parse the timestamp shapes providers use: RFC 3339, naive `T...Z`
/// without offset and bare dates (midnight UTC)
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Fresh activity identifier
pub(crate) fn new_activity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
