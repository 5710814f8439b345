//! Retry configuration and exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retries after the initial attempt for a transient failure
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Cap on any single retry delay
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Jitter applied on top of the exponential delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// Exact exponential delay
    None,
}

/// Retry policy shared by connector HTTP calls and scheduler job retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Jitter mode
    pub jitter: Jitter,
    /// Give unknown failures one retry
    pub retry_unknown: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: Jitter::Full,
            retry_unknown: false,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (zero-based), jitter excluded
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Delay to sleep before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let cap = ceiling.as_millis() as u64;
                if cap == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
            }
        }
    }
}
