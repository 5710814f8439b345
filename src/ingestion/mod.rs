//! Shared ingestion building blocks
//!
//! Connectors compose these rather than re-implementing them:
//! - [`rate_limit`] - per-credential token bucket
//! - [`pagination`] - cursor/offset page state with a page budget
//! - [`classify`] - error classes and the single retry decision
//! - [`backoff`] - exponential backoff with jitter
//! - [`http`] - the rate-limited retrying request loop

pub mod backoff;
pub mod classify;
pub mod http;
pub mod pagination;
pub mod rate_limit;

pub use backoff::{Jitter, RetryPolicy};
pub use classify::{ClassifiedError, ErrorClass, ErrorClassifier};
pub use http::ProviderHttpClient;
pub use pagination::{PagePosition, PaginationCursor, PaginationError};
pub use rate_limit::{RateLimitError, RateLimiter};
