//! Token-bucket rate limiting for outbound calls of one named client.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::StateInformationMiddleware;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use thiserror::Error;

type DirectRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, DefaultClock, StateInformationMiddleware>;

/// Static budget of a token bucket: burst `capacity` refilled at `refill_rate` tokens/second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitBudget {
    pub capacity: u32,
    pub refill_rate: f64,
}

impl RateLimitBudget {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_rate,
        }
    }

    /// `max_calls` per `period`, the shape used in source configuration.
    pub fn per_period(max_calls: u32, period: Duration) -> Self {
        let capacity = max_calls.max(1);
        let period_secs = period.as_secs_f64().max(0.001);
        Self::new(capacity, f64::from(capacity) / period_secs)
    }

    fn quota(self) -> Quota {
        let burst = NonZeroU32::new(self.capacity).unwrap_or(NonZeroU32::MIN);
        let rate = if self.refill_rate.is_finite() && self.refill_rate > 0.0 {
            self.refill_rate
        } else {
            f64::from(self.capacity)
        };
        let period = Duration::from_secs_f64((1.0 / rate).max(0.000_001));

        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

/// Per-client token bucket. Concurrent callers share one budget; the GCRA state
/// inside `governor` is updated atomically, so aggregate throughput never exceeds
/// `refill_rate` and bursts never exceed `capacity`.
pub struct TokenBucketLimiter {
    budget: RateLimitBudget,
    limiter: DirectRateLimiter,
    last_remaining: AtomicU32,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("budget", &self.budget)
            .field("last_remaining", &self.last_remaining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TokenBucketLimiter {
    pub fn new(budget: RateLimitBudget) -> Self {
        Self {
            budget,
            limiter: RateLimiter::direct(budget.quota())
                .with_middleware::<StateInformationMiddleware>(),
            last_remaining: AtomicU32::new(budget.capacity),
        }
    }

    pub const fn budget(&self) -> RateLimitBudget {
        self.budget
    }

    /// Waits until `n` tokens are available and consumes them.
    ///
    /// Returns the tokens left in the bucket right after the acquisition.
    pub async fn acquire(&self, n: u32) -> Result<u32, ThrottleError> {
        let Some(cells) = NonZeroU32::new(n) else {
            return Ok(self.last_remaining());
        };

        let snapshot = self
            .limiter
            .until_n_ready(cells)
            .await
            .map_err(|_| self.exceeds(n))?;
        let remaining = snapshot.remaining_burst_capacity();
        self.last_remaining.store(remaining, Ordering::Relaxed);
        Ok(remaining)
    }

    /// Consumes `n` tokens only if they are available right now.
    pub fn try_acquire(&self, n: u32) -> Result<bool, ThrottleError> {
        let Some(cells) = NonZeroU32::new(n) else {
            return Ok(true);
        };

        match self.limiter.check_n(cells) {
            Ok(Ok(snapshot)) => {
                self.last_remaining
                    .store(snapshot.remaining_burst_capacity(), Ordering::Relaxed);
                Ok(true)
            }
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(self.exceeds(n)),
        }
    }

    /// Tokens left as observed by the most recent successful acquisition.
    pub fn last_remaining(&self) -> u32 {
        self.last_remaining.load(Ordering::Relaxed)
    }

    fn exceeds(&self, requested: u32) -> ThrottleError {
        ThrottleError::ExceedsCapacity {
            requested,
            capacity: self.budget.capacity,
        }
    }
}
