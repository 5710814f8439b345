//! Configuration loader and validator.
//!
//! The YAML file mirrors [`AppConfig`]. Every section has defaults, so an
//! empty file (or no file at all) yields a usable local setup with no
//! connectors. Secrets can be given inline or through `*_env` keys naming an
//! environment variable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::batch::SchedulerConfig;
use crate::ingestion::RetryPolicy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// YAML syntax or schema error
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Values parse but are unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    /// A secret was configured through an unset environment variable
    #[error("environment variable {var} for {field} is not set")]
    MissingEnv {
        /// Config field the variable backs
        field: &'static str,
        /// Variable name
        var: String,
    },
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Database settings
    pub database: DatabaseConfig,
    /// Batch scheduler settings
    pub scheduler: SchedulerConfig,
    /// Retry policy for provider requests
    pub retry: RetryPolicy,
    /// Configured provider connectors
    pub connectors: ConnectorsConfig,
    /// Prometheus scrape endpoint; metrics are not exported when absent
    pub metrics_addr: Option<SocketAddr>,
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,
    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://carbon-ingest.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Per-provider connector sections
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectorsConfig {
    /// cloud-a
    pub aws: Option<AwsConfig>,
    /// cloud-b
    pub azure: Option<AzureConfig>,
    /// cloud-c
    pub gcp: Option<GcpConfig>,
}

/// Optional overrides of a connector's rate limit, deadline and paging
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitOverrides {
    /// Token bucket capacity
    pub rate_limit_capacity: Option<f64>,
    /// Refill rate in tokens per second
    pub rate_limit_per_second: Option<f64>,
    /// Deadline per request in seconds
    pub timeout_secs: Option<u64>,
    /// Page budget per data source
    pub max_pages: Option<u32>,
    /// Items per page
    pub page_size: Option<u32>,
}

/// Effective connector limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectorLimits {
    /// Token bucket capacity
    pub rate_limit_capacity: f64,
    /// Refill rate in tokens per second
    pub rate_limit_per_second: f64,
    /// Deadline per request
    pub timeout: Duration,
    /// Page budget per data source
    pub max_pages: u32,
    /// Items per page
    pub page_size: u32,
}

impl ConnectorLimits {
    /// cloud-a defaults: 100 burst, 5/s, 30 s
    pub const AWS: ConnectorLimits = ConnectorLimits {
        rate_limit_capacity: 100.0,
        rate_limit_per_second: 5.0,
        timeout: Duration::from_secs(30),
        max_pages: 1000,
        page_size: 100,
    };

    /// cloud-b defaults: 60 burst, 3/s, 45 s
    pub const AZURE: ConnectorLimits = ConnectorLimits {
        rate_limit_capacity: 60.0,
        rate_limit_per_second: 3.0,
        timeout: Duration::from_secs(45),
        max_pages: 1000,
        page_size: 1000,
    };

    /// cloud-c defaults: 200 burst, 20/s, 60 s
    pub const GCP: ConnectorLimits = ConnectorLimits {
        rate_limit_capacity: 200.0,
        rate_limit_per_second: 20.0,
        timeout: Duration::from_secs(60),
        max_pages: 1000,
        page_size: 1000,
    };

    /// Apply overrides on top of these defaults
    pub fn with_overrides(self, overrides: &LimitOverrides) -> Self {
        Self {
            rate_limit_capacity: overrides
                .rate_limit_capacity
                .unwrap_or(self.rate_limit_capacity),
            rate_limit_per_second: overrides
                .rate_limit_per_second
                .unwrap_or(self.rate_limit_per_second),
            timeout: overrides
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
            max_pages: overrides.max_pages.unwrap_or(self.max_pages),
            page_size: overrides.page_size.unwrap_or(self.page_size),
        }
    }
}

/// cloud-a (AWS) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AwsConfig {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key (prefer `secret_access_key_env`)
    pub secret_access_key: Option<String>,
    /// Environment variable holding the secret access key
    pub secret_access_key_env: Option<String>,
    /// Temporary session token
    pub session_token: Option<String>,
    /// Signing region
    pub region: String,
    /// Account id, recorded in activity metadata
    pub account_id: Option<String>,
    /// Carbon footprint API endpoint; derived from the region when absent
    pub endpoint: Option<String>,
    /// Optional Cost and Usage Report location
    pub cur: Option<CurConfig>,
    /// Rate limit and paging overrides
    pub limits: LimitOverrides,
}

/// Cost and Usage Report location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CurConfig {
    /// S3 bucket
    pub bucket: String,
    /// Report prefix containing `manifest.json`
    pub prefix: String,
    /// S3 endpoint; virtual-hosted bucket URL when absent
    pub endpoint: Option<String>,
}

impl AwsConfig {
    /// Resolve the secret access key
    pub fn secret_access_key(&self) -> Result<String, ConfigError> {
        resolve_secret(
            "aws.secret_access_key",
            self.secret_access_key.as_deref(),
            self.secret_access_key_env.as_deref(),
        )
    }

    /// Signing region, `us-east-1` when unset
    pub fn region(&self) -> &str {
        if self.region.trim().is_empty() {
            "us-east-1"
        } else {
            &self.region
        }
    }

    /// Carbon footprint API base URL
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ce.{}.amazonaws.com", self.region()))
    }

    /// Effective limits
    pub fn limits(&self) -> ConnectorLimits {
        ConnectorLimits::AWS.with_overrides(&self.limits)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_key_id.trim().is_empty() {
            return Err(invalid("connectors.aws.access_key_id must be non-empty"));
        }
        self.secret_access_key()?;
        if let Some(cur) = &self.cur {
            if cur.bucket.trim().is_empty() {
                return Err(invalid("connectors.aws.cur.bucket must be non-empty"));
            }
        }
        validate_limits("aws", &self.limits())
    }
}

impl CurConfig {
    /// Bucket base URL
    pub fn bucket_url(&self, region: &str) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.s3.{region}.amazonaws.com", self.bucket))
    }
}

/// cloud-b (Azure) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AzureConfig {
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Application (client) id
    pub client_id: String,
    /// Client secret (prefer `client_secret_env`)
    pub client_secret: Option<String>,
    /// Environment variable holding the client secret
    pub client_secret_env: Option<String>,
    /// Subscription to read emissions for
    pub subscription_id: String,
    /// OAuth authority; `https://login.microsoftonline.com` when absent
    pub authority: Option<String>,
    /// Management API endpoint; `https://management.azure.com` when absent
    pub endpoint: Option<String>,
    /// Refresh the token this many seconds before expiry
    pub refresh_threshold_secs: Option<u64>,
    /// Rate limit and paging overrides
    pub limits: LimitOverrides,
}

impl AzureConfig {
    /// Resolve the client secret
    pub fn client_secret(&self) -> Result<String, ConfigError> {
        resolve_secret(
            "azure.client_secret",
            self.client_secret.as_deref(),
            self.client_secret_env.as_deref(),
        )
    }

    /// OAuth token URL for the tenant
    pub fn token_url(&self) -> String {
        let authority = self
            .authority
            .as_deref()
            .unwrap_or("https://login.microsoftonline.com")
            .trim_end_matches('/');
        format!("{authority}/{}/oauth2/v2.0/token", self.tenant_id)
    }

    /// Management API base URL
    pub fn endpoint(&self) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or("https://management.azure.com")
            .trim_end_matches('/')
            .to_string()
    }

    /// Proactive token refresh window
    pub fn refresh_threshold(&self) -> Duration {
        refresh_threshold(self.refresh_threshold_secs)
    }

    /// Effective limits
    pub fn limits(&self) -> ConnectorLimits {
        ConnectorLimits::AZURE.with_overrides(&self.limits)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.trim().is_empty() {
            return Err(invalid("connectors.azure.tenant_id must be non-empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("connectors.azure.client_id must be non-empty"));
        }
        if self.subscription_id.trim().is_empty() {
            return Err(invalid("connectors.azure.subscription_id must be non-empty"));
        }
        self.client_secret()?;
        validate_limits("azure", &self.limits())
    }
}

/// cloud-c (GCP) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcpConfig {
    /// Project that runs the BigQuery job
    pub project_id: String,
    /// Billing account the export belongs to
    pub billing_account_id: Option<String>,
    /// Dataset containing the carbon footprint export
    pub dataset: String,
    /// Export table; `carbon_footprint` when empty
    pub table: String,
    /// Path to the service-account JSON key
    pub service_account_key_path: Option<PathBuf>,
    /// Environment variable holding the service-account JSON key itself
    pub service_account_key_env: Option<String>,
    /// BigQuery REST base URL
    pub bigquery_endpoint: Option<String>,
    /// Overrides the key's `token_uri`
    pub token_uri: Option<String>,
    /// Refresh the access token this many seconds before expiry
    pub refresh_threshold_secs: Option<u64>,
    /// Rate limit and paging overrides
    pub limits: LimitOverrides,
}

impl GcpConfig {
    /// Load the service-account key JSON text
    pub fn service_account_key(&self) -> Result<String, ConfigError> {
        if let Some(path) = &self.service_account_key_path {
            return Ok(fs::read_to_string(path)?);
        }
        resolve_secret(
            "gcp.service_account_key",
            None,
            self.service_account_key_env.as_deref(),
        )
    }

    /// Export table name
    pub fn table(&self) -> &str {
        if self.table.trim().is_empty() {
            "carbon_footprint"
        } else {
            &self.table
        }
    }

    /// BigQuery REST base URL
    pub fn bigquery_endpoint(&self) -> String {
        self.bigquery_endpoint
            .as_deref()
            .unwrap_or("https://bigquery.googleapis.com/bigquery/v2")
            .trim_end_matches('/')
            .to_string()
    }

    /// Proactive token refresh window
    pub fn refresh_threshold(&self) -> Duration {
        refresh_threshold(self.refresh_threshold_secs)
    }

    /// Effective limits
    pub fn limits(&self) -> ConnectorLimits {
        ConnectorLimits::GCP.with_overrides(&self.limits)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(invalid("connectors.gcp.project_id must be non-empty"));
        }
        if self.dataset.trim().is_empty() {
            return Err(invalid("connectors.gcp.dataset must be non-empty"));
        }
        if self.service_account_key_path.is_none() && self.service_account_key_env.is_none() {
            return Err(invalid(
                "connectors.gcp requires service_account_key_path or service_account_key_env",
            ));
        }
        validate_limits("gcp", &self.limits())
    }
}

/// Default proactive refresh window for OAuth access tokens
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 300;

fn refresh_threshold(secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(DEFAULT_REFRESH_THRESHOLD_SECS))
}

impl AppConfig {
    /// Load configuration from a YAML file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = if content.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate a configuration instance
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(invalid("database.url must be non-empty"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be > 0"));
        }

        let s = &self.scheduler;
        if s.poll_interval_ms == 0 {
            return Err(invalid("scheduler.poll_interval_ms must be > 0"));
        }
        if s.worker_pool_size == 0 {
            return Err(invalid("scheduler.worker_pool_size must be > 0"));
        }
        if s.batch_size == 0 {
            return Err(invalid("scheduler.batch_size must be > 0"));
        }
        if s.lock_ttl_ms < 3 {
            return Err(invalid("scheduler.lock_ttl_ms must be >= 3"));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }

        if let Some(aws) = &self.connectors.aws {
            aws.validate()?;
        }
        if let Some(azure) = &self.connectors.azure {
            azure.validate()?;
        }
        if let Some(gcp) = &self.connectors.gcp {
            gcp.validate()?;
        }
        Ok(())
    }
}

fn resolve_secret(
    field: &'static str,
    inline: Option<&str>,
    env: Option<&str>,
) -> Result<String, ConfigError> {
    if let Some(var) = env {
        return std::env::var(var).map_err(|_| ConfigError::MissingEnv {
            field,
            var: var.to_string(),
        });
    }
    match inline {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(ConfigError::Invalid(format!("{field} must be set"))),
    }
}

fn validate_limits(provider: &str, limits: &ConnectorLimits) -> Result<(), ConfigError> {
    if limits.rate_limit_capacity <= 0.0 || limits.rate_limit_per_second <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "connectors.{provider} rate limits must be > 0"
        )));
    }
    if limits.max_pages == 0 || limits.page_size == 0 {
        return Err(ConfigError::Invalid(format!(
            "connectors.{provider} max_pages and page_size must be > 0"
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
