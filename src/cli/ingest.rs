//! Ingest command implementation

use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use super::{CliError, Output};
use crate::batch::{BatchService, BatchStore};
use crate::collaborators::SqliteActivityStore;
use crate::config::AppConfig;
use crate::connectors::{ConnectorSet, IngestRequest, Provider};
use crate::pipeline::{IngestionPipeline, SubmitOptions};
use crate::shutdown::SharedShutdown;

/// Parse a point in time from YYYY-MM-DD (midnight UTC) or RFC 3339.
///
/// RFC 3339 input without an offset is taken as UTC.
pub fn parse_datetime_flexible(input: &str) -> Result<DateTime<Utc>, CliError> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Ok(dt.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|e| CliError::InvalidArgument(format!("Invalid date '{input}': {e}")))?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| CliError::InvalidArgument(format!("Invalid date '{input}'")))
}

/// Ingest command arguments
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Provider to ingest from (aws, azure, gcp)
    #[arg(long)]
    pub provider: Provider,

    /// Organization the activities belong to
    #[arg(long)]
    pub org: String,

    /// Workspace the activities belong to
    #[arg(long)]
    pub workspace: String,

    /// Start of the usage window, inclusive (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub start: String,

    /// End of the usage window, exclusive (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub end: String,

    /// Submit the ingested activities as a batch job
    #[arg(long, default_value_t = false)]
    pub submit: bool,

    /// Job priority; higher runs first
    #[arg(long)]
    pub priority: Option<i64>,

    /// Job-level retry budget
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Stop the job at the first non-retryable activity failure
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,
}

#[derive(Debug, Serialize)]
struct IngestSummary {
    provider: String,
    activities: usize,
    job_id: Option<String>,
    elapsed_ms: u64,
}

impl IngestArgs {
    /// Build the connector request from the arguments
    pub fn request(&self) -> Result<IngestRequest, CliError> {
        let start = parse_datetime_flexible(&self.start)?;
        let end = parse_datetime_flexible(&self.end)?;
        if start >= end {
            return Err(CliError::InvalidArgument(format!(
                "start ({start}) must be before end ({end})"
            )));
        }
        Ok(IngestRequest::new(&self.org, &self.workspace, start, end))
    }

    /// Execute the ingest command
    pub async fn execute(
        &self,
        config: &AppConfig,
        store: BatchStore,
        shutdown: SharedShutdown,
        out: Output,
    ) -> Result<(), CliError> {
        let request = self.request()?;
        let connectors = ConnectorSet::from_config(&config.connectors, &config.retry)?;
        if connectors.get(self.provider).is_none() {
            return Err(CliError::InvalidArgument(format!(
                "provider {} is not configured (configured: {:?})",
                self.provider,
                connectors.providers()
            )));
        }

        let activities = Arc::new(SqliteActivityStore::new(store.pool().clone()));
        let service = BatchService::new(store).with_defaults(config.scheduler.clone());
        let pipeline = IngestionPipeline::new(connectors, activities, service);

        let options = SubmitOptions {
            submit: self.submit,
            priority: self.priority,
            max_retries: self.max_retries,
            fail_fast: self.fail_fast.then_some(true),
        };
        let report = pipeline
            .run(self.provider, &request, &options, &shutdown)
            .await?;

        let summary = IngestSummary {
            provider: report.provider.to_string(),
            activities: report.activity_ids.len(),
            job_id: report.job_id.clone(),
            elapsed_ms: report.elapsed.as_millis() as u64,
        };
        out.emit(&summary, |s| {
            let job = s
                .job_id
                .as_deref()
                .map(|id| format!(", submitted as {id}"))
                .unwrap_or_default();
            format!(
                "Ingested {} activities from {} in {} ms{job}",
                s.activities, s.provider, s.elapsed_ms
            )
        })
    }
}
