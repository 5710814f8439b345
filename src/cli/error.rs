//! CLI error types and conversions

use crate::batch::BatchError;
use crate::config::ConfigError;
use crate::metrics::MetricsError;
use crate::pipeline::PipelineError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration file or override is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Job store or scheduler error
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Ingest pipeline error
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// Prometheus exporter could not be installed
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// JSON output encoding failed
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
