//! Production observability metrics for the ingestion pipeline
//!
//! This module provides metrics collection for provider requests, retry
//! behavior, rate limiter health, taxonomy gaps and batch job processing.
//!
//! ## Architecture
//!
//! - `metrics` facade macros at every recording site
//! - Optional Prometheus exporter for a scraping endpoint (`--metrics-addr`)
//! - Without an installed recorder every macro is a no-op, so library code
//!   records unconditionally

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Set once the exporter is installed
static METRICS_INITIALIZED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

/// Monotonic source for request correlation ids
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors from metrics initialization
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be installed (address in use, recorder already set)
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Safe to call more than once; later calls are no-ops.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!(%addr, "Initializing metrics system");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_metrics();

    *initialized = true;
    info!(%addr, "Metrics system initialized successfully");
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "connector_requests_total",
        Unit::Count,
        "Total number of HTTP requests made to provider APIs"
    );
    describe_counter!(
        "connector_errors_total",
        Unit::Count,
        "Classified connector failures by error class"
    );
    describe_counter!(
        "connector_records_total",
        Unit::Count,
        "Activities produced by connectors"
    );
    describe_counter!(
        "connector_bytes_total",
        Unit::Bytes,
        "Response bytes received from provider APIs"
    );
    describe_counter!(
        "connector_retries_total",
        Unit::Count,
        "Connector request retries"
    );
    describe_counter!(
        "taxonomy_unmapped_total",
        Unit::Count,
        "Provider service or region codes missing from the taxonomy tables"
    );
    describe_counter!(
        "batch_jobs_transitions_total",
        Unit::Count,
        "Batch job status transitions"
    );
    describe_counter!(
        "batch_activities_total",
        Unit::Count,
        "Activities processed by batch workers by outcome"
    );
    describe_histogram!(
        "connector_request_duration_seconds",
        Unit::Seconds,
        "Provider HTTP request duration in seconds"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Backoff slept before a connector retry"
    );
    describe_histogram!(
        "rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for rate limiter tokens"
    );
    describe_histogram!(
        "batch_job_duration_seconds",
        Unit::Seconds,
        "Wall time of one worker pass over a batch job"
    );
    describe_gauge!(
        "batch_queue_depth",
        Unit::Count,
        "Jobs waiting to be processed"
    );
    describe_gauge!(
        "batch_workers_active",
        Unit::Count,
        "Workers currently processing a job"
    );
    describe_gauge!(
        "rate_limit_tokens_available",
        Unit::Count,
        "Tokens left in the rate limiter bucket"
    );
}

/// Next request correlation id (`req-` followed by 8 hex digits)
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Records one provider HTTP request with timing
pub struct ConnectorRequestMetrics {
    provider: &'static str,
    source: String,
    start_time: Instant,
    correlation_id: String,
    attempt: u32,
}

impl ConnectorRequestMetrics {
    /// Start recording a new request
    pub fn start(provider: &'static str, source: impl Into<String>, attempt: u32) -> Self {
        let source = source.into();
        let correlation_id = generate_correlation_id();

        debug!(
            correlation_id = %correlation_id,
            provider,
            source = %source,
            attempt,
            "Starting provider request"
        );

        Self {
            provider,
            source,
            start_time: Instant::now(),
            correlation_id,
            attempt,
        }
    }

    /// Record a response with `status` and `bytes` of body
    pub fn record_complete(&self, status_code: u16, bytes: usize) {
        let duration = self.start_time.elapsed();

        counter!(
            "connector_requests_total",
            "provider" => self.provider,
            "status" => status_code.to_string(),
        )
        .increment(1);
        counter!("connector_bytes_total", "provider" => self.provider).increment(bytes as u64);
        histogram!(
            "connector_request_duration_seconds",
            "provider" => self.provider,
        )
        .record(duration.as_secs_f64());

        if status_code == 429 {
            warn!(
                correlation_id = %self.correlation_id,
                provider = self.provider,
                source = %self.source,
                attempt = self.attempt,
                duration_ms = duration.as_millis() as u64,
                "Provider throttled request (429)"
            );
        }

        debug!(
            correlation_id = %self.correlation_id,
            provider = self.provider,
            source = %self.source,
            status = status_code,
            bytes,
            duration_ms = duration.as_millis() as u64,
            "Provider request completed"
        );
    }

    /// Record a transport failure or timeout (no status code)
    pub fn record_network_error(&self) {
        let duration = self.start_time.elapsed();

        counter!(
            "connector_requests_total",
            "provider" => self.provider,
            "status" => "network_error",
        )
        .increment(1);
        histogram!(
            "connector_request_duration_seconds",
            "provider" => self.provider,
        )
        .record(duration.as_secs_f64());

        warn!(
            correlation_id = %self.correlation_id,
            provider = self.provider,
            source = %self.source,
            attempt = self.attempt,
            duration_ms = duration.as_millis() as u64,
            "Network error recorded"
        );
    }
}

/// Record a classified connector failure
pub fn record_connector_error(provider: &'static str, class: &'static str) {
    counter!("connector_errors_total", "provider" => provider, "class" => class).increment(1);
}

/// Record one connector retry and its backoff
pub fn record_retry_backoff(provider: &'static str, duration: Duration, attempt: u32) {
    counter!("connector_retries_total", "provider" => provider).increment(1);
    histogram!("retry_backoff_duration_seconds", "provider" => provider)
        .record(duration.as_secs_f64());

    debug!(
        provider,
        attempt,
        backoff_ms = duration.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Record activities produced by a connector
pub fn record_connector_records(provider: &'static str, count: usize) {
    counter!("connector_records_total", "provider" => provider).increment(count as u64);
}

/// Record a provider code missing from a taxonomy table
pub fn record_taxonomy_unmapped(provider: &'static str, table: &'static str) {
    counter!("taxonomy_unmapped_total", "provider" => provider, "table" => table).increment(1);
}

/// Record tokens taken from a rate limiter bucket after `waited`
pub fn record_rate_limit_acquired(limiter: &str, tokens: u32, waited: Duration, remaining: f64) {
    histogram!("rate_limit_wait_seconds", "limiter" => limiter.to_string())
        .record(waited.as_secs_f64());
    gauge!("rate_limit_tokens_available", "limiter" => limiter.to_string()).set(remaining);

    if waited >= Duration::from_millis(100) {
        debug!(
            limiter,
            tokens,
            wait_ms = waited.as_millis() as u64,
            remaining,
            "Rate limiter throttled request"
        );
    }
}

/// Record a batch job status transition
pub fn record_job_transition(from: &'static str, to: &'static str) {
    counter!("batch_jobs_transitions_total", "from" => from, "to" => to).increment(1);
}

/// Record one processed activity by outcome (`succeeded`, `failed`, `deferred`)
pub fn record_activity_outcome(outcome: &'static str) {
    counter!("batch_activities_total", "outcome" => outcome).increment(1);
}

/// Update the queue depth gauge
pub fn set_queue_depth(depth: u64) {
    gauge!("batch_queue_depth").set(depth as f64);
}

/// Update the active workers gauge
pub fn set_workers_active(active: usize) {
    gauge!("batch_workers_active").set(active as f64);
}

/// Batch job pass metrics
pub struct JobMetrics {
    job_id: String,
    worker_id: String,
    start_time: Instant,
}

impl JobMetrics {
    /// Start tracking a worker pass over a job
    pub fn start(job_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let worker_id = worker_id.into();

        info!(job_id = %job_id, worker_id = %worker_id, "Batch job started");

        Self {
            job_id,
            worker_id,
            start_time: Instant::now(),
        }
    }

    /// Record the status the pass ended in
    pub fn record_finished(&self, status: &'static str, succeeded: u64, failed: u64) {
        let duration = self.start_time.elapsed();

        histogram!("batch_job_duration_seconds", "status" => status)
            .record(duration.as_secs_f64());

        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            status,
            succeeded,
            failed,
            duration_ms = duration.as_millis() as u64,
            "Batch job pass finished"
        );
    }

    /// Record a pass aborted by an infrastructure error
    pub fn record_failure(&self, error: &str) {
        let duration = self.start_time.elapsed();

        histogram!("batch_job_duration_seconds", "status" => "error")
            .record(duration.as_secs_f64());

        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            error = %error,
            duration_ms = duration.as_millis() as u64,
            "Batch job pass aborted"
        );
    }
}

/// Whether [`init_metrics`] has installed the exporter
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}
