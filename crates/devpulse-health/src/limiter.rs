//! Per-service token-bucket rate limiting.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::CheckError;

/// Token bucket refilling at `rate` per second with a burst of twice that.
pub struct ServiceRateLimiter {
    limiter: DefaultDirectRateLimiter,
    rate: NonZeroU32,
}

impl ServiceRateLimiter {
    /// Returns `None` for a zero rate, which disables limiting.
    pub fn new(rate_per_second: u32) -> Option<Self> {
        let rate = NonZeroU32::new(rate_per_second)?;
        let burst = NonZeroU32::new(rate_per_second.saturating_mul(2)).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            rate,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate.get()
    }

    /// Wait for a token, giving up if the context is cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), CheckError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CheckError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
