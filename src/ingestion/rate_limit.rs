//! Token-bucket rate limiting
//!
//! One [`RateLimiter`] exists per (provider, credential) pair and is shared by
//! every concurrent request issued with that credential. Refill is computed
//! lazily on each call, so the limiter needs no background task.

use crate::metrics::record_rate_limit_acquired;
use crate::shutdown::ShutdownCoordinator;
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Default bucket capacity
pub const DEFAULT_CAPACITY: f64 = 100.0;

/// Default refill rate (tokens per second)
pub const DEFAULT_REFILL_PER_SECOND: f64 = 10.0;

/// Lower bound between two checks while waiting for tokens
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_millis(100);

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// The wait was cancelled before a token became available
    #[error("rate limiter wait cancelled")]
    Cancelled,

    /// More tokens requested than the bucket can ever hold
    #[error("requested {requested} tokens but capacity is {capacity}")]
    ExceedsCapacity {
        /// Tokens requested
        requested: u32,
        /// Bucket capacity
        capacity: f64,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter shared across concurrent callers
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_per_second: f64,
    min_wait: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket
    ///
    /// # Arguments
    /// * `name` - Label used in metrics (usually the provider)
    /// * `capacity` - Maximum burst size
    /// * `refill_per_second` - Sustained admission rate
    pub fn new(name: impl Into<String>, capacity: f64, refill_per_second: f64) -> Self {
        Self::with_min_wait(name, capacity, refill_per_second, DEFAULT_MIN_WAIT)
    }

    /// Create a limiter with an explicit minimum wait between checks
    pub fn with_min_wait(
        name: impl Into<String>,
        capacity: f64,
        refill_per_second: f64,
        min_wait: Duration,
    ) -> Self {
        let capacity = if capacity > 0.0 { capacity } else { DEFAULT_CAPACITY };
        let refill_per_second = if refill_per_second > 0.0 {
            refill_per_second
        } else {
            DEFAULT_REFILL_PER_SECOND
        };

        Self {
            name: name.into(),
            capacity,
            refill_per_second,
            min_wait,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket capacity
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Sustained refill rate in tokens per second
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Block until one token is available, then consume it.
    ///
    /// Returns how long the caller waited. Cancellation returns
    /// [`RateLimitError::Cancelled`] without consuming a token.
    pub async fn allow(&self, cancel: &ShutdownCoordinator) -> Result<Duration, RateLimitError> {
        self.allow_n(cancel, 1).await
    }

    /// Block until `n` tokens are available and reserve them atomically.
    pub async fn allow_n(
        &self,
        cancel: &ShutdownCoordinator,
        n: u32,
    ) -> Result<Duration, RateLimitError> {
        let needed = f64::from(n);
        if needed > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }

        let started = Instant::now();

        loop {
            if cancel.is_shutdown_requested() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = {
                let mut state = self.lock_state();
                self.refill(&mut state);
                if state.tokens >= needed {
                    state.tokens -= needed;
                    ControlFlow::Break(state.tokens)
                } else {
                    let deficit = needed - state.tokens;
                    let until_refilled = Duration::from_secs_f64(deficit / self.refill_per_second);
                    ControlFlow::Continue(until_refilled.max(self.min_wait))
                }
            };

            match wait {
                ControlFlow::Break(remaining) => {
                    let waited = started.elapsed();
                    record_rate_limit_acquired(&self.name, n, waited, remaining);
                    return Ok(waited);
                }
                ControlFlow::Continue(delay) => {
                    if !cancel.sleep(delay).await {
                        return Err(RateLimitError::Cancelled);
                    }
                }
            }
        }
    }

    /// Consume one token without blocking. Returns whether it succeeded.
    pub fn try_allow(&self) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after a lazy refill)
    pub fn available(&self) -> f64 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens
    }

    /// Refill the bucket to capacity
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // A panic while holding the lock cannot leave the bucket inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
