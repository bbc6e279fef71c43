//! Token bucket rate limiting for mutating API routes.
//!
//! Tokens are added at `requests_per_second` up to `burst_size`; each
//! purchase or plan change consumes one. Reads, cancellation and webhook
//! deliveries are not limited. A request that finds the bucket empty is
//! rejected with [`PortalError::RateLimitExceeded`] rather than queued.
//!
//! ```rust
//! use membership_portal::security::{RateLimitConfig, RateLimiter};
//!
//! # async fn example() -> membership_portal::error::Result<()> {
//! let limiter = RateLimiter::new(RateLimitConfig { requests_per_second: 10, burst_size: 5 });
//! limiter.acquire().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::{PortalError, Result};

/// Tokens are stored as fixed-point thousandths.
const TOKEN_SCALE: u64 = 1000;

/// Rate and burst capacity of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second.
    ///
    /// Default: 10
    pub requests_per_second: u32,

    /// Bucket capacity; the bucket starts full.
    ///
    /// Default: 5
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_second: 10, burst_size: 5 }
    }
}

/// Token bucket rate limiter, safe to share behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    tokens: AtomicU64,
    last_update: Mutex<Instant>,
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tokens: AtomicU64::new(u64::from(config.burst_size) * TOKEN_SCALE),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Takes one token or fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::RateLimitExceeded`] when the bucket is empty or
    /// another caller took the last token first.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self) -> Result<()> {
        self.refill().await;

        let current = self.tokens.load(Ordering::Acquire);
        if current < TOKEN_SCALE {
            warn!(tokens_available = current / TOKEN_SCALE, "rate limit exceeded");
            return Err(PortalError::RateLimitExceeded);
        }

        match self.tokens.compare_exchange(
            current,
            current - TOKEN_SCALE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(tokens_remaining = (current - TOKEN_SCALE) / TOKEN_SCALE, "token acquired");
                Ok(())
            }
            Err(_) => {
                warn!("token acquisition race, rate limit exceeded");
                Err(PortalError::RateLimitExceeded)
            }
        }
    }

    async fn refill(&self) {
        let mut last_update = self.last_update.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_update);

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "elapsed is non-negative and the sum is capped at burst_size"
        )]
        let to_add = (elapsed.as_secs_f64()
            * f64::from(self.config.requests_per_second)
            * TOKEN_SCALE as f64) as u64;

        if to_add == 0 {
            return;
        }

        let max_tokens = u64::from(self.config.burst_size) * TOKEN_SCALE;
        // The closure never returns None, so the update cannot fail.
        let _ = self.tokens.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add(to_add).min(max_tokens))
        });
        *last_update = now;
    }
}
