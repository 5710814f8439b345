//! Rate-limited, retrying HTTP client shared by all provider connectors
//!
//! Each attempt acquires a rate-limiter token, builds a fresh request (so
//! credentials and signatures are renewed per attempt), enforces a per-request
//! deadline and classifies the outcome. Only [`ErrorClassifier::should_retry`]
//! decides whether to retry.

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::backoff::RetryPolicy;
use super::classify::{ClassifiedError, ErrorClass, ErrorClassifier};
use super::rate_limit::RateLimiter;
use crate::metrics::{record_connector_error, record_retry_backoff, ConnectorRequestMetrics};
use crate::shutdown::ShutdownCoordinator;

/// HTTP client bound to one provider's limiter, timeout and retry policy
#[derive(Debug, Clone)]
pub struct ProviderHttpClient {
    client: Client,
    provider: &'static str,
    limiter: Arc<RateLimiter>,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ProviderHttpClient {
    /// Create new provider client
    ///
    /// # Arguments
    /// * `provider` - Label used in logs and metrics
    /// * `limiter` - Limiter shared by every request made with this credential
    /// * `retry` - Backoff and retry budget for transient failures
    /// * `timeout` - Deadline applied to each individual attempt
    pub fn new(
        provider: &'static str,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let classifier = if retry.retry_unknown {
            ErrorClassifier::retrying_unknown_once()
        } else {
            ErrorClassifier::new()
        };

        Self {
            client: Client::new(),
            provider,
            limiter,
            classifier,
            retry,
            timeout,
        }
    }

    /// Underlying reqwest client used to build requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shared rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request built by `build`, retrying transient failures.
    ///
    /// `build` runs once per attempt; auth headers it attaches are therefore
    /// refreshed on every retry. Returns the response body of the first
    /// successful (2xx) attempt.
    pub async fn send<F, Fut>(
        &self,
        source: &str,
        cancel: &ShutdownCoordinator,
        build: F,
    ) -> Result<String, ClassifiedError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RequestBuilder, ClassifiedError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_shutdown_requested() {
                return Err(cancelled(self.provider, source));
            }

            let outcome = match self.limiter.allow(cancel).await {
                Ok(waited) => {
                    if !waited.is_zero() {
                        debug!(
                            provider = self.provider,
                            source,
                            waited_ms = waited.as_millis() as u64,
                            "Rate limiter delayed request"
                        );
                    }
                    match build().await {
                        Ok(request) => self.attempt(source, attempt, request).await,
                        Err(err) => Err(err),
                    }
                }
                Err(err) => return Err(ClassifiedError::from(err)),
            };

            let err = match outcome {
                Ok(body) => {
                    if attempt > 0 {
                        debug!(
                            provider = self.provider,
                            source,
                            attempt = attempt + 1,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(body);
                }
                Err(err) => err,
            };

            record_connector_error(self.provider, err.class.as_str());

            let retryable = self.classifier.should_retry(&err, attempt);
            if !retryable || attempt >= self.retry.max_retries || cancel.is_shutdown_requested() {
                if err.class == ErrorClass::Fatal {
                    error!(
                        provider = self.provider,
                        source,
                        attempt = attempt + 1,
                        error = %err,
                        "Provider request failed"
                    );
                } else {
                    warn!(
                        provider = self.provider,
                        source,
                        attempt = attempt + 1,
                        retryable,
                        error = %err,
                        suggestion = err.class.suggestion(),
                        "Provider request failed"
                    );
                }
                return Err(err);
            }

            let backoff = self.retry.delay_for(attempt);
            warn!(
                provider = self.provider,
                source,
                attempt = attempt + 1,
                max_attempts = self.retry.max_retries + 1,
                class = err.class.as_str(),
                backoff_ms = backoff.as_millis() as u64,
                "Transient provider error, retrying"
            );
            record_retry_backoff(self.provider, backoff, attempt);

            if !cancel.sleep(backoff).await {
                return Err(cancelled(self.provider, source));
            }
            attempt += 1;
        }
    }

    /// Like [`send`](Self::send) but deserializes the body as JSON
    pub async fn send_json<T, F, Fut>(
        &self,
        source: &str,
        cancel: &ShutdownCoordinator,
        build: F,
    ) -> Result<T, ClassifiedError>
    where
        T: DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RequestBuilder, ClassifiedError>>,
    {
        let body = self.send(source, cancel, build).await?;
        parse_json(&body, source)
    }

    async fn attempt(
        &self,
        source: &str,
        attempt: u32,
        request: RequestBuilder,
    ) -> Result<String, ClassifiedError> {
        let metrics = ConnectorRequestMetrics::start(self.provider, source, attempt);

        let exchange = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok((status, body))) => {
                metrics.record_complete(status, body.len());
                if (200..300).contains(&status) {
                    Ok(body)
                } else {
                    Err(ClassifiedError::from_status(status, &body))
                }
            }
            Ok(Err(err)) => {
                metrics.record_network_error();
                let class = self.classifier.classify_reqwest(&err);
                Err(ClassifiedError::with_source(class, err.to_string(), err))
            }
            Err(elapsed) => {
                metrics.record_network_error();
                Err(ClassifiedError::with_source(
                    ErrorClass::Transient,
                    format!("request exceeded {}ms deadline", self.timeout.as_millis()),
                    elapsed,
                ))
            }
        }
    }
}

/// Deserialize a provider payload; malformed payloads are BadRequest
pub fn parse_json<T: DeserializeOwned>(body: &str, source: &str) -> Result<T, ClassifiedError> {
    serde_json::from_str(body).map_err(|e| {
        ClassifiedError::with_source(
            ErrorClass::BadRequest,
            format!("malformed {source} response: {e}"),
            e,
        )
    })
}

fn cancelled(provider: &'static str, source: &str) -> ClassifiedError {
    debug!(provider, source, "Request cancelled");
    ClassifiedError::transient(format!("{provider} {source} request cancelled"))
}
