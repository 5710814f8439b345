//! Error classification shared by connectors and the batch scheduler.
//!
//! Every failure (transport, HTTP status, provider payload, calculator) is
//! folded into one of six [`ErrorClass`] values. [`ErrorClassifier::should_retry`]
//! is the only place that decides whether a failure is retried; connector
//! retry loops and scheduler job retries both call it.

use super::pagination::PaginationError;
use super::rate_limit::RateLimitError;
use reqwest::Error as ReqwestError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Retry-relevant failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failure, timeout or rate limiting; retried with backoff
    Transient,
    /// Credential or permission failure
    Auth,
    /// Malformed request, payload or configuration
    BadRequest,
    /// Referenced resource does not exist
    NotFound,
    /// Unrecoverable provider or server error
    Fatal,
    /// Nothing better fits; not retried unless configured
    Unknown,
}

impl ErrorClass {
    /// Stable label used in metrics and persisted job state
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Auth => "auth",
            ErrorClass::BadRequest => "bad_request",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Short description for operator-facing messages
    pub fn description(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "temporary failure",
            ErrorClass::Auth => "authentication failed",
            ErrorClass::BadRequest => "invalid request",
            ErrorClass::NotFound => "resource not found",
            ErrorClass::Fatal => "unrecoverable provider error",
            ErrorClass::Unknown => "unclassified error",
        }
    }

    /// Suggested remediation presented alongside final failures
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "The request will be retried; if it persists check provider status",
            ErrorClass::Auth => "Verify credentials, tenant/project ids and granted permissions",
            ErrorClass::BadRequest => "Review connector configuration and date range",
            ErrorClass::NotFound => "Check that the subscription, bucket or dataset exists",
            ErrorClass::Fatal => "Provider reported an internal error; contact provider support if it repeats",
            ErrorClass::Unknown => "Inspect the error message and logs for details",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "auth" => Ok(ErrorClass::Auth),
            "bad_request" => Ok(ErrorClass::BadRequest),
            "not_found" => Ok(ErrorClass::NotFound),
            "fatal" => Ok(ErrorClass::Fatal),
            "unknown" => Ok(ErrorClass::Unknown),
            _ => Err(format!("Invalid error class: {s}")),
        }
    }
}

/// An error tagged with its retry-relevant class
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// Failure class
    pub class: ErrorClass,
    /// Human-readable message
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ClassifiedError {
    /// Create a classified error without an underlying cause
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create a classified error wrapping `source`
    pub fn with_source<E>(class: ErrorClass, message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            class,
            message: message.into(),
            status: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Build from an HTTP status and (possibly truncated) response body
    pub fn from_status(status: u16, body: &str) -> Self {
        let class = ErrorClassifier::classify_status(status);
        let body = truncate(body, 512);
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        Self {
            class,
            message,
            status: Some(status),
            source: None,
        }
    }

    /// Shorthand for a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    /// Shorthand for a bad-request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::BadRequest, message)
    }

    /// Shorthand for a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, message)
    }

    /// Whether the class alone makes this error retryable
    pub fn retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    /// Prefix the message with context, keeping class, status and cause
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Maps failures into [`ErrorClass`] and decides retry eligibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorClassifier {
    retry_unknown: bool,
}

impl ErrorClassifier {
    /// Classifier that retries only transient failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier that additionally retries an unknown failure once
    pub fn retrying_unknown_once() -> Self {
        Self {
            retry_unknown: true,
        }
    }

    /// Whether unknown errors get a single retry
    pub fn retries_unknown(&self) -> bool {
        self.retry_unknown
    }

    /// Map an HTTP status to its class
    pub fn classify_status(status: u16) -> ErrorClass {
        match status {
            408 | 429 | 502 | 503 | 504 => ErrorClass::Transient,
            401 | 403 => ErrorClass::Auth,
            400 | 409 | 422 => ErrorClass::BadRequest,
            404 => ErrorClass::NotFound,
            500 | 501 | 505..=599 => ErrorClass::Fatal,
            _ => ErrorClass::Unknown,
        }
    }

    /// Classify by well-known substrings of an error message
    pub fn classify_message(message: &str) -> ErrorClass {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&[
            "timeout",
            "timed out",
            "deadline exceeded",
            "connection refused",
            "connection reset",
            "rate limit",
            "too many requests",
            "temporarily unavailable",
        ]) {
            ErrorClass::Transient
        } else if has(&["unauthorized", "forbidden", "invalid credentials", "access denied"]) {
            ErrorClass::Auth
        } else if has(&["not found", "no such"]) {
            ErrorClass::NotFound
        } else if has(&["invalid", "malformed", "bad request"]) {
            ErrorClass::BadRequest
        } else {
            ErrorClass::Unknown
        }
    }

    /// Classify a reqwest transport or status error
    pub fn classify_reqwest(&self, err: &ReqwestError) -> ErrorClass {
        if let Some(status) = err.status() {
            return Self::classify_status(status.as_u16());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return ErrorClass::Transient;
        }
        if err.is_decode() || err.is_body() || err.is_builder() {
            return ErrorClass::BadRequest;
        }
        Self::classify_message(&err.to_string())
    }

    /// Classify any error.
    ///
    /// Already-classified errors pass through unchanged; reqwest and tokio
    /// timeout errors are inspected; anything else falls back to message
    /// matching.
    pub fn classify(&self, err: &(dyn StdError + 'static)) -> ClassifiedError {
        if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
            return classified.clone();
        }
        if let Some(reqwest_err) = err.downcast_ref::<ReqwestError>() {
            return ClassifiedError {
                class: self.classify_reqwest(reqwest_err),
                message: reqwest_err.to_string(),
                status: reqwest_err.status().map(|s| s.as_u16()),
                source: None,
            };
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ClassifiedError::transient("deadline exceeded");
        }
        ClassifiedError::new(Self::classify_message(&err.to_string()), err.to_string())
    }

    /// Whether a failure on zero-based `attempt` should be retried
    pub fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool {
        match err.class {
            ErrorClass::Transient => true,
            ErrorClass::Unknown => self.retry_unknown && attempt == 0,
            _ => false,
        }
    }
}

impl From<RateLimitError> for ClassifiedError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled => ClassifiedError::with_source(
                ErrorClass::Transient,
                "cancelled while waiting for rate limiter",
                err,
            ),
            RateLimitError::ExceedsCapacity { .. } => {
                ClassifiedError::with_source(ErrorClass::BadRequest, err.to_string(), err)
            }
        }
    }
}

impl From<PaginationError> for ClassifiedError {
    fn from(err: PaginationError) -> Self {
        ClassifiedError::with_source(ErrorClass::Fatal, err.to_string(), err)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
