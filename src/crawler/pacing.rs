//! Request pacing: randomized delays, cancellable sleeps and a per-host
//! token bucket. Every delay produced here is a lower bound.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::{thread_rng, Rng};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cli::config::DelayRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl DelayRange {
    /// Draw a delay uniformly from the range
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

/// Exponential backoff: `base * 2^attempt + jitter`
pub fn backoff_delay(base_ms: u64, attempt: u32, jitter: &DelayRange) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)) + jitter.sample()
}

/// Sleep for at least `duration`, returning early only on cancellation
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Cancelled),
    }
}

/// Token bucket keyed by target host, so each engine is paced on its own
pub struct HostLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl HostLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(requests).allow_burst(NonZeroU32::MIN);

        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Wait for the host's next token
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let key = host.to_string();

        tokio::select! {
            _ = self.limiter.until_key_ready(&key) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }
}
