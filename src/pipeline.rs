//! Ingest, persist and submit in one call

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::batch::{BatchError, BatchService, SubmitJob};
use crate::collaborators::ActivityStore;
use crate::connectors::{ConnectorSet, IngestRequest, Provider};
use crate::ingestion::ClassifiedError;
use crate::shutdown::ShutdownCoordinator;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The provider has no configured connector
    #[error("no connector configured for {0}")]
    NotConfigured(Provider),

    /// The connector failed; nothing was stored
    #[error("ingestion failed: {0}")]
    Ingest(#[from] ClassifiedError),

    /// Activities could not be persisted; no job was submitted
    #[error("storing activities failed: {0}")]
    Store(#[source] ClassifiedError),

    /// Activities were stored but the job could not be created
    #[error("submitting batch job failed: {0}")]
    Submit(#[from] BatchError),
}

/// Submission settings for [`IngestionPipeline::run`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    /// Create a batch job for the ingested activities
    pub submit: bool,
    /// Job priority; the default applies when `None`
    pub priority: Option<i64>,
    /// Job retry budget; the service default applies when `None`
    pub max_retries: Option<u32>,
    /// Failure policy; the service default applies when `None`
    pub fail_fast: Option<bool>,
}

/// What a pipeline run did
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Provider ingested from
    pub provider: Provider,
    /// Ids of the stored activities, in connector order
    pub activity_ids: Vec<String>,
    /// Submitted job, if any
    pub job_id: Option<String>,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Connector output flows into the activity store and from there into a job
pub struct IngestionPipeline {
    connectors: ConnectorSet,
    activities: Arc<dyn ActivityStore>,
    service: BatchService,
}

impl IngestionPipeline {
    /// Assemble a pipeline
    pub fn new(
        connectors: ConnectorSet,
        activities: Arc<dyn ActivityStore>,
        service: BatchService,
    ) -> Self {
        Self {
            connectors,
            activities,
            service,
        }
    }

    /// Ingest `request` from `provider`, store every activity and optionally
    /// submit them as one job.
    ///
    /// Ingestion is all-or-nothing, and so is storing: either every activity
    /// is persisted or none is.
    pub async fn run(
        &self,
        provider: Provider,
        request: &IngestRequest,
        options: &SubmitOptions,
        cancel: &ShutdownCoordinator,
    ) -> Result<PipelineReport, PipelineError> {
        let span = info_span!(
            "pipeline",
            provider = %provider,
            org_id = %request.org_id,
            workspace_id = %request.workspace_id
        );
        self.run_inner(provider, request, options, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        provider: Provider,
        request: &IngestRequest,
        options: &SubmitOptions,
        cancel: &ShutdownCoordinator,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let connector = self
            .connectors
            .get(provider)
            .ok_or(PipelineError::NotConfigured(provider))?;

        request.validate()?;
        let activities = connector.ingest(request, cancel).await?;
        info!(count = activities.len(), "Ingestion finished");

        self.activities
            .store_many(&activities)
            .await
            .map_err(PipelineError::Store)?;
        let activity_ids: Vec<String> = activities.into_iter().map(|a| a.id).collect();

        let job_id = if options.submit && !activity_ids.is_empty() {
            let mut submit = SubmitJob::new(
                request.org_id.clone(),
                request.workspace_id.clone(),
                activity_ids.clone(),
            );
            if let Some(priority) = options.priority {
                submit = submit.with_priority(priority);
            }
            submit.max_retries = options.max_retries;
            submit.fail_fast = options.fail_fast;
            let id = self.service.submit(submit).await?;
            info!(job_id = %id, "Batch job submitted");
            Some(id)
        } else {
            if options.submit {
                info!("Nothing ingested, no job submitted");
            }
            None
        };

        Ok(PipelineReport {
            provider,
            activity_ids,
            job_id,
            elapsed: started.elapsed(),
        })
    }
}
